//! FUSE wire protocol definitions, version 7.36.
//!
//! Struct layouts mirror `linux/fuse.h`. Every message body is a plain-old-data
//! struct marked [`ByteValued`] so it can be read from and written to guest
//! memory without intermediate copies.

use bitflags::bitflags;
use vm_memory::ByteValued;

/// Protocol major version advertised in the INIT reply.
pub const KERNEL_VERSION: u32 = 7;

/// Protocol minor version advertised in the INIT reply.
pub const KERNEL_MINOR_VERSION: u32 = 36;

/// Oldest client minor version this server accepts.
pub const MIN_KERNEL_MINOR_VERSION: u32 = 31;

/// Inode id of the filesystem root, fixed by the protocol.
pub const ROOT_ID: u64 = 1;

// Flags returned in `OpenOut::open_flags`.
const FOPEN_DIRECT_IO: u32 = 1;
const FOPEN_KEEP_CACHE: u32 = 1 << 1;
const FOPEN_NONSEEKABLE: u32 = 1 << 2;
const FOPEN_CACHE_DIR: u32 = 1 << 3;
const FOPEN_STREAM: u32 = 1 << 4;
const FOPEN_NOFLUSH: u32 = 1 << 5;

bitflags! {
    /// Hints attached to an OPEN/OPENDIR/CREATE reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenOptions: u32 {
        const DIRECT_IO = FOPEN_DIRECT_IO;
        const KEEP_CACHE = FOPEN_KEEP_CACHE;
        const NONSEEKABLE = FOPEN_NONSEEKABLE;
        const CACHE_DIR = FOPEN_CACHE_DIR;
        const STREAM = FOPEN_STREAM;
        const NOFLUSH = FOPEN_NOFLUSH;
    }
}

// INIT request/reply flags. The first 32 bits travel in `InitIn::flags` /
// `InitOut::flags`, the rest in `flags2` when `INIT_EXT` is negotiated.
const ASYNC_READ: u64 = 1;
const POSIX_LOCKS: u64 = 1 << 1;
const FILE_OPS: u64 = 1 << 2;
const ATOMIC_O_TRUNC: u64 = 1 << 3;
const EXPORT_SUPPORT: u64 = 1 << 4;
const BIG_WRITES: u64 = 1 << 5;
const DONT_MASK: u64 = 1 << 6;
const SPLICE_WRITE: u64 = 1 << 7;
const SPLICE_MOVE: u64 = 1 << 8;
const SPLICE_READ: u64 = 1 << 9;
const FLOCK_LOCKS: u64 = 1 << 10;
const HAS_IOCTL_DIR: u64 = 1 << 11;
const AUTO_INVAL_DATA: u64 = 1 << 12;
const DO_READDIRPLUS: u64 = 1 << 13;
const READDIRPLUS_AUTO: u64 = 1 << 14;
const ASYNC_DIO: u64 = 1 << 15;
const WRITEBACK_CACHE: u64 = 1 << 16;
const NO_OPEN_SUPPORT: u64 = 1 << 17;
const PARALLEL_DIROPS: u64 = 1 << 18;
const HANDLE_KILLPRIV: u64 = 1 << 19;
const POSIX_ACL: u64 = 1 << 20;
const ABORT_ERROR: u64 = 1 << 21;
const MAX_PAGES: u64 = 1 << 22;
const CACHE_SYMLINKS: u64 = 1 << 23;
const NO_OPENDIR_SUPPORT: u64 = 1 << 24;
const EXPLICIT_INVAL_DATA: u64 = 1 << 25;
const MAP_ALIGNMENT: u64 = 1 << 26;
const SUBMOUNTS: u64 = 1 << 27;
const HANDLE_KILLPRIV_V2: u64 = 1 << 28;
const SETXATTR_EXT: u64 = 1 << 29;
const INIT_EXT: u64 = 1 << 30;
const INIT_RESERVED: u64 = 1 << 31;
const SECURITY_CTX: u64 = 1 << 32;
const HAS_INODE_DAX: u64 = 1 << 33;

bitflags! {
    /// Session capability bits exchanged during INIT.
    ///
    /// Bits 0..32 map to `fuse_init_in.flags`, bits 32..64 to `flags2`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsOptions: u64 {
        const ASYNC_READ = ASYNC_READ;
        const POSIX_LOCKS = POSIX_LOCKS;
        const FILE_OPS = FILE_OPS;
        const ATOMIC_O_TRUNC = ATOMIC_O_TRUNC;
        const EXPORT_SUPPORT = EXPORT_SUPPORT;
        const BIG_WRITES = BIG_WRITES;
        const DONT_MASK = DONT_MASK;
        const SPLICE_WRITE = SPLICE_WRITE;
        const SPLICE_MOVE = SPLICE_MOVE;
        const SPLICE_READ = SPLICE_READ;
        const FLOCK_LOCKS = FLOCK_LOCKS;
        const HAS_IOCTL_DIR = HAS_IOCTL_DIR;
        const AUTO_INVAL_DATA = AUTO_INVAL_DATA;
        const DO_READDIRPLUS = DO_READDIRPLUS;
        const READDIRPLUS_AUTO = READDIRPLUS_AUTO;
        const ASYNC_DIO = ASYNC_DIO;
        const WRITEBACK_CACHE = WRITEBACK_CACHE;
        const NO_OPEN_SUPPORT = NO_OPEN_SUPPORT;
        const PARALLEL_DIROPS = PARALLEL_DIROPS;
        const HANDLE_KILLPRIV = HANDLE_KILLPRIV;
        const POSIX_ACL = POSIX_ACL;
        const ABORT_ERROR = ABORT_ERROR;
        const MAX_PAGES = MAX_PAGES;
        const CACHE_SYMLINKS = CACHE_SYMLINKS;
        const NO_OPENDIR_SUPPORT = NO_OPENDIR_SUPPORT;
        const EXPLICIT_INVAL_DATA = EXPLICIT_INVAL_DATA;
        const MAP_ALIGNMENT = MAP_ALIGNMENT;
        const SUBMOUNTS = SUBMOUNTS;
        const HANDLE_KILLPRIV_V2 = HANDLE_KILLPRIV_V2;
        const SETXATTR_EXT = SETXATTR_EXT;
        const INIT_EXT = INIT_EXT;
        const INIT_RESERVED = INIT_RESERVED;
        const SECURITY_CTX = SECURITY_CTX;
        const HAS_INODE_DAX = HAS_INODE_DAX;
    }
}

// `SetattrIn::valid` bits.
const FATTR_MODE: u32 = 1;
const FATTR_UID: u32 = 1 << 1;
const FATTR_GID: u32 = 1 << 2;
const FATTR_SIZE: u32 = 1 << 3;
const FATTR_ATIME: u32 = 1 << 4;
const FATTR_MTIME: u32 = 1 << 5;
const FATTR_FH: u32 = 1 << 6;
const FATTR_ATIME_NOW: u32 = 1 << 7;
const FATTR_MTIME_NOW: u32 = 1 << 8;
const FATTR_LOCKOWNER: u32 = 1 << 9;
const FATTR_CTIME: u32 = 1 << 10;
const FATTR_KILL_SUIDGID: u32 = 1 << 11;

bitflags! {
    /// Which fields of a SETATTR request are meaningful.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetattrValid: u32 {
        const MODE = FATTR_MODE;
        const UID = FATTR_UID;
        const GID = FATTR_GID;
        const SIZE = FATTR_SIZE;
        const ATIME = FATTR_ATIME;
        const MTIME = FATTR_MTIME;
        const FH = FATTR_FH;
        const ATIME_NOW = FATTR_ATIME_NOW;
        const MTIME_NOW = FATTR_MTIME_NOW;
        const LOCKOWNER = FATTR_LOCKOWNER;
        const CTIME = FATTR_CTIME;
        const KILL_SUIDGID = FATTR_KILL_SUIDGID;
    }
}

/// WRITE request: delayed write from the page cache.
pub const WRITE_CACHE: u32 = 1;
/// WRITE request: `lock_owner` field is valid.
pub const WRITE_LOCKOWNER: u32 = 1 << 1;
/// WRITE request: kill suid/sgid bits while writing.
pub const WRITE_KILL_SUIDGID: u32 = 1 << 2;

/// RELEASE request: perform a flush.
pub const RELEASE_FLUSH: u32 = 1;
/// RELEASE request: drop the handle's flock lock.
pub const RELEASE_FLOCK_UNLOCK: u32 = 1 << 1;

/// GETATTR request: `fh` field is valid.
pub const GETATTR_FH: u32 = 1;

/// READ request: `lock_owner` field is valid.
pub const READ_LOCKOWNER: u32 = 1 << 1;

/// Lock request concerns a BSD `flock` lock rather than a POSIX record lock.
pub const LK_FLOCK: u32 = 1;

/// OPEN request: kill suid/sgid bits on truncation.
pub const OPEN_KILL_SUIDGID: u32 = 1;

/// SETXATTR request: clear SGID when an ACL grants write access.
pub const SETXATTR_ACL_KILL_SGID: u32 = 1;

/// Offset value meaning "to end of file" in lock ranges.
pub const LOCK_OFFSET_MAX: u64 = 0x7fff_ffff_ffff_ffff;

/// Request opcodes understood by this server.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Getlk = 31,
    Setlk = 32,
    Setlkw = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36,
    Bmap = 37,
    Destroy = 38,
    Ioctl = 39,
    Poll = 40,
    NotifyReply = 41,
    BatchForget = 42,
    Fallocate = 43,
    Readdirplus = 44,
    Rename2 = 45,
    Lseek = 46,
    CopyFileRange = 47,
    SetupMapping = 48,
    RemoveMapping = 49,
    Syncfs = 50,
    Unknown = u32::MAX,
}

impl From<u32> for Opcode {
    fn from(op: u32) -> Opcode {
        match op {
            1 => Opcode::Lookup,
            2 => Opcode::Forget,
            3 => Opcode::Getattr,
            4 => Opcode::Setattr,
            5 => Opcode::Readlink,
            6 => Opcode::Symlink,
            8 => Opcode::Mknod,
            9 => Opcode::Mkdir,
            10 => Opcode::Unlink,
            11 => Opcode::Rmdir,
            12 => Opcode::Rename,
            13 => Opcode::Link,
            14 => Opcode::Open,
            15 => Opcode::Read,
            16 => Opcode::Write,
            17 => Opcode::Statfs,
            18 => Opcode::Release,
            20 => Opcode::Fsync,
            21 => Opcode::Setxattr,
            22 => Opcode::Getxattr,
            23 => Opcode::Listxattr,
            24 => Opcode::Removexattr,
            25 => Opcode::Flush,
            26 => Opcode::Init,
            27 => Opcode::Opendir,
            28 => Opcode::Readdir,
            29 => Opcode::Releasedir,
            30 => Opcode::Fsyncdir,
            31 => Opcode::Getlk,
            32 => Opcode::Setlk,
            33 => Opcode::Setlkw,
            34 => Opcode::Access,
            35 => Opcode::Create,
            36 => Opcode::Interrupt,
            37 => Opcode::Bmap,
            38 => Opcode::Destroy,
            39 => Opcode::Ioctl,
            40 => Opcode::Poll,
            41 => Opcode::NotifyReply,
            42 => Opcode::BatchForget,
            43 => Opcode::Fallocate,
            44 => Opcode::Readdirplus,
            45 => Opcode::Rename2,
            46 => Opcode::Lseek,
            47 => Opcode::CopyFileRange,
            48 => Opcode::SetupMapping,
            49 => Opcode::RemoveMapping,
            50 => Opcode::Syncfs,
            _ => Opcode::Unknown,
        }
    }
}

/// File attributes as carried in entry and attr replies.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub flags: u32,
}
unsafe impl ByteValued for Attr {}

impl From<libc::stat64> for Attr {
    fn from(st: libc::stat64) -> Attr {
        Attr {
            ino: st.st_ino,
            size: st.st_size as u64,
            blocks: st.st_blocks as u64,
            atime: st.st_atime as u64,
            mtime: st.st_mtime as u64,
            ctime: st.st_ctime as u64,
            atimensec: st.st_atime_nsec as u32,
            mtimensec: st.st_mtime_nsec as u32,
            ctimensec: st.st_ctime_nsec as u32,
            mode: st.st_mode,
            nlink: st.st_nlink as u32,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u32,
            blksize: st.st_blksize as u32,
            flags: 0,
        }
    }
}

/// Filesystem statistics for the STATFS reply.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Kstatfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
    pub padding: u32,
    pub spare: [u32; 6],
}
unsafe impl ByteValued for Kstatfs {}

impl From<libc::statvfs64> for Kstatfs {
    fn from(st: libc::statvfs64) -> Kstatfs {
        Kstatfs {
            blocks: st.f_blocks,
            bfree: st.f_bfree,
            bavail: st.f_bavail,
            files: st.f_files,
            ffree: st.f_ffree,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
            ..Kstatfs::default()
        }
    }
}

/// Byte-range lock description shared by GETLK/SETLK.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLock {
    pub start: u64,
    pub end: u64,
    pub lock_type: u32,
    pub pid: u32,
}
unsafe impl ByteValued for FileLock {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub total_extlen: u16,
    pub padding: u16,
}
unsafe impl ByteValued for InHeader {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}
unsafe impl ByteValued for OutHeader {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}
unsafe impl ByteValued for EntryOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ForgetIn {
    pub nlookup: u64,
}
unsafe impl ByteValued for ForgetIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ForgetOne {
    pub nodeid: u64,
    pub nlookup: u64,
}
unsafe impl ByteValued for ForgetOne {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchForgetIn {
    pub count: u32,
    pub dummy: u32,
}
unsafe impl ByteValued for BatchForgetIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GetattrIn {
    pub flags: u32,
    pub dummy: u32,
    pub fh: u64,
}
unsafe impl ByteValued for GetattrIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct AttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: Attr,
}
unsafe impl ByteValued for AttrOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SetattrIn {
    pub valid: u32,
    pub padding: u32,
    pub fh: u64,
    pub size: u64,
    pub lock_owner: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub unused4: u32,
    pub uid: u32,
    pub gid: u32,
    pub unused5: u32,
}
unsafe impl ByteValued for SetattrIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MknodIn {
    pub mode: u32,
    pub rdev: u32,
    pub umask: u32,
    pub padding: u32,
}
unsafe impl ByteValued for MknodIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MkdirIn {
    pub mode: u32,
    pub umask: u32,
}
unsafe impl ByteValued for MkdirIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameIn {
    pub newdir: u64,
}
unsafe impl ByteValued for RenameIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Rename2In {
    pub newdir: u64,
    pub flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for Rename2In {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkIn {
    pub oldnodeid: u64,
}
unsafe impl ByteValued for LinkIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenIn {
    pub flags: u32,
    pub open_flags: u32,
}
unsafe impl ByteValued for OpenIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateIn {
    pub flags: u32,
    pub mode: u32,
    pub umask: u32,
    pub open_flags: u32,
}
unsafe impl ByteValued for CreateIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for OpenOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ReleaseIn {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}
unsafe impl ByteValued for ReleaseIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushIn {
    pub fh: u64,
    pub unused: u32,
    pub padding: u32,
    pub lock_owner: u64,
}
unsafe impl ByteValued for FlushIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for ReadIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for WriteIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteOut {
    pub size: u32,
    pub padding: u32,
}
unsafe impl ByteValued for WriteOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct StatfsOut {
    pub st: Kstatfs,
}
unsafe impl ByteValued for StatfsOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FsyncIn {
    pub fh: u64,
    pub fsync_flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for FsyncIn {}

/// SETXATTR body. The short (two field) compat layout is used unless
/// `SETXATTR_EXT` was negotiated.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SetxattrIn {
    pub size: u32,
    pub flags: u32,
    pub setxattr_flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for SetxattrIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SetxattrInCompat {
    pub size: u32,
    pub flags: u32,
}
unsafe impl ByteValued for SetxattrInCompat {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GetxattrIn {
    pub size: u32,
    pub padding: u32,
}
unsafe impl ByteValued for GetxattrIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GetxattrOut {
    pub size: u32,
    pub padding: u32,
}
unsafe impl ByteValued for GetxattrOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LkIn {
    pub fh: u64,
    pub owner: u64,
    pub lk: FileLock,
    pub lk_flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for LkIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LkOut {
    pub lk: FileLock,
}
unsafe impl ByteValued for LkOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub flags2: u32,
    pub unused: [u32; 11],
}
unsafe impl ByteValued for InitIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
    pub max_pages: u16,
    pub map_alignment: u16,
    pub flags2: u32,
    pub unused: [u32; 7],
}
unsafe impl ByteValued for InitOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessIn {
    pub mask: u32,
    pub padding: u32,
}
unsafe impl ByteValued for AccessIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptIn {
    pub unique: u64,
}
unsafe impl ByteValued for InterruptIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FallocateIn {
    pub fh: u64,
    pub offset: u64,
    pub length: u64,
    pub mode: u32,
    pub padding: u32,
}
unsafe impl ByteValued for FallocateIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LseekIn {
    pub fh: u64,
    pub offset: u64,
    pub whence: u32,
    pub padding: u32,
}
unsafe impl ByteValued for LseekIn {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LseekOut {
    pub offset: u64,
}
unsafe impl ByteValued for LseekOut {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyFileRangeIn {
    pub fh_in: u64,
    pub off_in: u64,
    pub nodeid_out: u64,
    pub fh_out: u64,
    pub off_out: u64,
    pub len: u64,
    pub flags: u64,
}
unsafe impl ByteValued for CopyFileRangeIn {}

/// One directory entry in a READDIR reply; followed by the name, padded to
/// an 8-byte boundary.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Dirent {
    pub ino: u64,
    pub off: u64,
    pub namelen: u32,
    pub type_: u32,
}
unsafe impl ByteValued for Dirent {}

/// One directory entry in a READDIRPLUS reply.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DirentPlus {
    pub entry_out: EntryOut,
    pub dirent: Dirent,
}
unsafe impl ByteValued for DirentPlus {}

/// Alignment unit for directory entries.
pub const DIRENT_PADDING: usize = 8;

/// Header preceding the security contexts appended to create-class requests
/// when `SECURITY_CTX` was negotiated.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SecctxHeader {
    pub size: u32,
    pub nr_secctx: u32,
}
unsafe impl ByteValued for SecctxHeader {}

/// One security context entry: this struct, then the NUL-terminated xattr
/// name, then the value, `size` bytes in total.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Secctx {
    pub size: u32,
    pub padding: u32,
}
unsafe impl ByteValued for Secctx {}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn test_header_sizes_match_wire_format() {
        assert_eq!(size_of::<InHeader>(), 40);
        assert_eq!(size_of::<OutHeader>(), 16);
        assert_eq!(size_of::<Attr>(), 88);
        assert_eq!(size_of::<EntryOut>(), 128);
        assert_eq!(size_of::<AttrOut>(), 104);
        assert_eq!(size_of::<InitIn>(), 64);
        assert_eq!(size_of::<InitOut>(), 64);
        assert_eq!(size_of::<Dirent>(), 24);
        assert_eq!(size_of::<DirentPlus>(), 152);
        assert_eq!(size_of::<WriteIn>(), 40);
        assert_eq!(size_of::<LkIn>(), 48);
    }

    #[test]
    fn test_opcode_round_trip() {
        assert_eq!(Opcode::from(1), Opcode::Lookup);
        assert_eq!(Opcode::from(26), Opcode::Init);
        assert_eq!(Opcode::from(47), Opcode::CopyFileRange);
        assert_eq!(Opcode::from(7), Opcode::Unknown);
        assert_eq!(Opcode::from(9999), Opcode::Unknown);
    }

    #[test]
    fn test_fs_options_split_across_flag_words() {
        let opts = FsOptions::ASYNC_READ | FsOptions::SECURITY_CTX;
        assert_eq!(opts.bits() as u32, 1);
        assert_eq!((opts.bits() >> 32) as u32, 1);
    }

    #[test]
    fn test_attr_from_stat() {
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        st.st_ino = 42;
        st.st_mode = libc::S_IFREG | 0o644;
        st.st_size = 1024;
        st.st_uid = 1000;

        let attr = Attr::from(st);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.mode, libc::S_IFREG | 0o644);
        assert_eq!(attr.size, 1024);
        assert_eq!(attr.uid, 1000);
    }
}
