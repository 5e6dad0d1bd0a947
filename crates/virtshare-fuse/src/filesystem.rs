//! The filesystem trait served by the request dispatcher.
//!
//! One method per FUSE operation. Implementations speak raw OS errnos:
//! whatever `io::Error` a method returns is negated into the reply header
//! unmodified. Unimplemented operations answer `ENOSYS`, which the guest
//! kernel interprets as "stop sending this opcode".

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::abi::{FileLock, FsOptions, OpenOptions, SetattrValid};

fn enosys<T>() -> io::Result<T> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// Credentials of the guest process that issued a request.
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub pid: libc::pid_t,
}

/// Result of resolving a name to an inode.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    /// Server-assigned inode id; echoed by the guest in later requests.
    pub inode: u64,
    /// Generation number for NFS-style export support; unused here.
    pub generation: u64,
    /// Attributes at resolution time.
    pub attr: libc::stat64,
    /// How long the guest may cache `attr`.
    pub attr_timeout: Duration,
    /// How long the guest may cache the name-to-inode mapping.
    pub entry_timeout: Duration,
}

/// Reply to a GETXATTR request.
#[derive(Debug)]
pub enum GetxattrReply {
    /// The value, for requests with a non-zero buffer size.
    Value(Vec<u8>),
    /// The size a value-fetching request would need, for size-probing
    /// requests.
    Count(u32),
}

/// Reply to a LISTXATTR request.
#[derive(Debug)]
pub enum ListxattrReply {
    /// Concatenated NUL-terminated attribute names.
    Names(Vec<u8>),
    Count(u32),
}

/// One directory entry produced by readdir.
#[derive(Debug)]
pub struct DirEntry<'a> {
    pub ino: u64,
    /// Stream offset of the *next* entry.
    pub offset: u64,
    pub type_: u32,
    pub name: &'a [u8],
}

/// A security context (`security.*` xattr) the guest kernel attached to a
/// create-class request.
#[derive(Debug, Clone)]
pub struct SecContext {
    pub name: CString,
    pub value: Vec<u8>,
}

/// Optional request payload appended after the regular operation body.
#[derive(Debug, Clone, Default)]
pub struct Extensions {
    pub security_ctx: Option<SecContext>,
}

/// Destination for READ replies: data is moved from a host descriptor into
/// the reply buffer without passing through server memory.
pub trait ZeroCopyWriter {
    fn write_from_file_at(&mut self, fd: RawFd, count: usize, offset: u64) -> io::Result<usize>;
    fn available_bytes(&self) -> usize;
}

/// Source for WRITE payloads: data is moved from the request buffer into a
/// host descriptor without passing through server memory.
pub trait ZeroCopyReader {
    fn read_to_file_at(&mut self, fd: RawFd, count: usize, offset: u64) -> io::Result<usize>;
    fn available_bytes(&self) -> usize;
}

impl ZeroCopyWriter for crate::buffer::Writer<'_> {
    fn write_from_file_at(&mut self, fd: RawFd, count: usize, offset: u64) -> io::Result<usize> {
        crate::buffer::Writer::write_from_file_at(self, fd, count, offset)
    }

    fn available_bytes(&self) -> usize {
        crate::buffer::Writer::available_bytes(self)
    }
}

impl ZeroCopyReader for crate::buffer::Reader<'_> {
    fn read_to_file_at(&mut self, fd: RawFd, count: usize, offset: u64) -> io::Result<usize> {
        crate::buffer::Reader::read_to_file_at(self, fd, count, offset)
    }

    fn available_bytes(&self) -> usize {
        crate::buffer::Reader::available_bytes(self)
    }
}

/// A filesystem served over the FUSE protocol.
///
/// Inodes and handles are the opaque 64-bit ids exchanged with the guest;
/// the implementation owns their meaning. All methods take `&self`: the
/// dispatcher calls them from many threads concurrently, serialized against
/// `init`/`destroy` only.
#[allow(unused_variables)]
pub trait FileSystem: Send + Sync {
    /// Negotiate session capabilities. `capable` is what the guest kernel
    /// offers; the return value is the subset this filesystem wants enabled.
    fn init(&self, capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    /// Tear down session state: release every outstanding lookup count.
    fn destroy(&self) {}

    fn lookup(&self, ctx: Context, parent: u64, name: &CString) -> io::Result<Entry> {
        enosys()
    }

    fn forget(&self, ctx: Context, inode: u64, count: u64) {}

    fn batch_forget(&self, ctx: Context, requests: Vec<(u64, u64)>) {
        for (inode, count) in requests {
            self.forget(ctx, inode, count);
        }
    }

    fn getattr(
        &self,
        ctx: Context,
        inode: u64,
        handle: Option<u64>,
    ) -> io::Result<(libc::stat64, Duration)> {
        enosys()
    }

    fn setattr(
        &self,
        ctx: Context,
        inode: u64,
        attr: libc::stat64,
        handle: Option<u64>,
        valid: SetattrValid,
    ) -> io::Result<(libc::stat64, Duration)> {
        enosys()
    }

    fn readlink(&self, ctx: Context, inode: u64) -> io::Result<Vec<u8>> {
        enosys()
    }

    fn symlink(
        &self,
        ctx: Context,
        linkname: &CString,
        parent: u64,
        name: &CString,
        extensions: Extensions,
    ) -> io::Result<Entry> {
        enosys()
    }

    fn mknod(
        &self,
        ctx: Context,
        parent: u64,
        name: &CString,
        mode: u32,
        rdev: u32,
        umask: u32,
        extensions: Extensions,
    ) -> io::Result<Entry> {
        enosys()
    }

    fn mkdir(
        &self,
        ctx: Context,
        parent: u64,
        name: &CString,
        mode: u32,
        umask: u32,
        extensions: Extensions,
    ) -> io::Result<Entry> {
        enosys()
    }

    fn unlink(&self, ctx: Context, parent: u64, name: &CString) -> io::Result<()> {
        enosys()
    }

    fn rmdir(&self, ctx: Context, parent: u64, name: &CString) -> io::Result<()> {
        enosys()
    }

    fn rename(
        &self,
        ctx: Context,
        olddir: u64,
        oldname: &CString,
        newdir: u64,
        newname: &CString,
        flags: u32,
    ) -> io::Result<()> {
        enosys()
    }

    fn link(&self, ctx: Context, inode: u64, newparent: u64, newname: &CString) -> io::Result<Entry> {
        enosys()
    }

    /// Open an existing file. Returns the handle (or `None` to run in
    /// handleless mode) and reply hints.
    fn open(
        &self,
        ctx: Context,
        inode: u64,
        flags: u32,
        fuse_flags: u32,
    ) -> io::Result<(Option<u64>, OpenOptions)> {
        // Handleless default: the guest will pass handle 0 everywhere.
        Ok((None, OpenOptions::empty()))
    }

    fn create(
        &self,
        ctx: Context,
        parent: u64,
        name: &CString,
        mode: u32,
        flags: u32,
        umask: u32,
        fuse_flags: u32,
        extensions: Extensions,
    ) -> io::Result<(Entry, Option<u64>, OpenOptions)> {
        enosys()
    }

    fn read(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        lock_owner: Option<u64>,
        flags: u32,
    ) -> io::Result<usize> {
        enosys()
    }

    fn write(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        lock_owner: Option<u64>,
        delayed_write: bool,
        kill_priv: bool,
        flags: u32,
    ) -> io::Result<usize> {
        enosys()
    }

    fn flush(&self, ctx: Context, inode: u64, handle: u64, lock_owner: u64) -> io::Result<()> {
        enosys()
    }

    fn fsync(&self, ctx: Context, inode: u64, datasync: bool, handle: Option<u64>) -> io::Result<()> {
        enosys()
    }

    fn release(
        &self,
        ctx: Context,
        inode: u64,
        flags: u32,
        handle: u64,
        flush: bool,
        flock_release: bool,
        lock_owner: Option<u64>,
    ) -> io::Result<()> {
        enosys()
    }

    fn statfs(&self, ctx: Context, inode: u64) -> io::Result<libc::statvfs64> {
        enosys()
    }

    fn setxattr(
        &self,
        ctx: Context,
        inode: u64,
        name: &CString,
        value: &[u8],
        flags: u32,
        extra_flags: u32,
    ) -> io::Result<()> {
        enosys()
    }

    fn getxattr(
        &self,
        ctx: Context,
        inode: u64,
        name: &CString,
        size: u32,
    ) -> io::Result<GetxattrReply> {
        enosys()
    }

    fn listxattr(&self, ctx: Context, inode: u64, size: u32) -> io::Result<ListxattrReply> {
        enosys()
    }

    fn removexattr(&self, ctx: Context, inode: u64, name: &CString) -> io::Result<()> {
        enosys()
    }

    fn opendir(
        &self,
        ctx: Context,
        inode: u64,
        flags: u32,
    ) -> io::Result<(Option<u64>, OpenOptions)> {
        Ok((None, OpenOptions::empty()))
    }

    fn readdir(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        enosys()
    }

    fn readdirplus(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry, Entry) -> io::Result<usize>,
    ) -> io::Result<()> {
        enosys()
    }

    fn releasedir(&self, ctx: Context, inode: u64, flags: u32, handle: u64) -> io::Result<()> {
        enosys()
    }

    fn fsyncdir(
        &self,
        ctx: Context,
        inode: u64,
        datasync: bool,
        handle: Option<u64>,
    ) -> io::Result<()> {
        enosys()
    }

    fn getlk(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        owner: u64,
        lock: FileLock,
    ) -> io::Result<FileLock> {
        enosys()
    }

    fn setlk(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        owner: u64,
        lock: FileLock,
        sleep: bool,
    ) -> io::Result<()> {
        enosys()
    }

    fn flock(&self, ctx: Context, inode: u64, handle: u64, operation: i32) -> io::Result<()> {
        enosys()
    }

    fn fallocate(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        mode: u32,
        offset: u64,
        length: u64,
    ) -> io::Result<()> {
        enosys()
    }

    fn lseek(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        offset: u64,
        whence: u32,
    ) -> io::Result<u64> {
        enosys()
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &self,
        ctx: Context,
        inode_in: u64,
        handle_in: u64,
        offset_in: u64,
        inode_out: u64,
        handle_out: u64,
        offset_out: u64,
        len: u64,
        flags: u64,
    ) -> io::Result<usize> {
        enosys()
    }

    fn access(&self, ctx: Context, inode: u64, mask: u32) -> io::Result<()> {
        enosys()
    }
}
