//! The passthrough [`FileSystem`] implementation.
//!
//! Every operation resolves its target through the inode or handle maps,
//! performs host I/O relative to long-lived descriptors, and passes raw
//! errnos back unchanged. Handlers never retry: one syscall, one reply.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;
use virtshare_fuse::abi::{
    FileLock, FsOptions, OpenOptions, SetattrValid, OPEN_KILL_SUIDGID, ROOT_ID,
    SETXATTR_ACL_KILL_SGID,
};
use virtshare_fuse::filesystem::{
    Context, DirEntry, Entry, Extensions, FileSystem, GetxattrReply, ListxattrReply, SecContext,
    ZeroCopyReader, ZeroCopyWriter,
};

use crate::cred::{become_caller, drop_fsetid};
use crate::handles::{DirStream, HandleData, Slab};
use crate::inode::{Inode, InodeIds, InodeTable};
use crate::locks;
use crate::procfs::{fd_name, FchdirGuard, ProcSelfFd};
use crate::xattr;
use crate::{CachePolicy, Config};

fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

fn eio() -> io::Error {
    io::Error::from_raw_os_error(libc::EIO)
}

fn stat_fd(fd: RawFd) -> io::Result<libc::stat64> {
    let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
    let res = unsafe {
        libc::fstatat64(
            fd,
            c"".as_ptr(),
            &mut st,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

fn ids_of(st: &libc::stat64) -> InodeIds {
    InodeIds {
        ino: st.st_ino,
        dev: st.st_dev,
    }
}

/// Path components handed to most operations must be single names.
/// LOOKUP is the documented exception and checks only for slashes.
fn is_safe_name(name: &CStr) -> bool {
    let bytes = name.to_bytes();
    bytes != b"." && bytes != b".." && !bytes.contains(&b'/')
}

/// Host directory tree exported as a FUSE filesystem.
pub struct PassthroughFs {
    config: Config,
    timeout: Duration,
    proc_self_fd: ProcSelfFd,
    root: Arc<Inode>,

    inodes: RwLock<InodeTable>,
    file_handles: RwLock<Slab<Arc<HandleData>>>,
    dir_handles: RwLock<Slab<Arc<DirStream>>>,

    // Negotiated per session during INIT.
    writeback: AtomicBool,
    posix_lock: AtomicBool,
    flock_enabled: AtomicBool,
}

impl PassthroughFs {
    /// Export `config.source`, resolving `/proc/self/fd` directly. Usable
    /// only while `/proc` is visible; the sandboxed daemon uses
    /// [`PassthroughFs::with_proc_self_fd`] with the dirfd it captured
    /// before pivoting.
    pub fn new(config: Config) -> io::Result<PassthroughFs> {
        let proc_self_fd = ProcSelfFd::open()?;
        Self::with_proc_self_fd(config, proc_self_fd)
    }

    pub fn with_proc_self_fd(config: Config, proc_self_fd: ProcSelfFd) -> io::Result<PassthroughFs> {
        let source = CString::new(config.source.as_os_str().as_bytes())
            .map_err(|_| einval())?;
        let fd = unsafe { libc::open(source.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let st = stat_fd(file.as_raw_fd())?;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }

        let root = Arc::new(Inode::new(file, ids_of(&st), st.st_mode));
        let timeout = config.effective_timeout();

        Ok(PassthroughFs {
            config,
            timeout,
            proc_self_fd,
            inodes: RwLock::new(InodeTable::new(Arc::clone(&root))),
            root,
            file_handles: RwLock::new(Slab::new()),
            dir_handles: RwLock::new(Slab::new()),
            writeback: AtomicBool::new(false),
            posix_lock: AtomicBool::new(false),
            flock_enabled: AtomicBool::new(false),
        })
    }

    /// Number of live inodes, the root included.
    pub fn inode_count(&self) -> usize {
        self.inodes.read().unwrap().len()
    }

    fn get_inode(&self, id: u64) -> io::Result<Arc<Inode>> {
        self.inodes.read().unwrap().get(id).ok_or_else(ebadf)
    }

    fn get_handle(&self, handle: u64) -> io::Result<Arc<HandleData>> {
        self.file_handles
            .read()
            .unwrap()
            .get(handle as usize)
            .cloned()
            .ok_or_else(ebadf)
    }

    fn get_dir(&self, handle: u64) -> io::Result<Arc<DirStream>> {
        self.dir_handles
            .read()
            .unwrap()
            .get(handle as usize)
            .cloned()
            .ok_or_else(ebadf)
    }

    fn entry_from(&self, inode: u64, attr: libc::stat64) -> Entry {
        Entry {
            inode,
            generation: 0,
            attr,
            attr_timeout: self.timeout,
            entry_timeout: self.timeout,
        }
    }

    /// Resolve `name` under `parent`, registering the result in the inode
    /// table. The caller's view of `..` on the root is the root itself.
    fn do_lookup(&self, parent_id: u64, name: &CStr) -> io::Result<Entry> {
        let parent = self.get_inode(parent_id)?;

        let name = if parent_id == ROOT_ID && name.to_bytes() == b".." {
            c"."
        } else {
            name
        };

        let fd = unsafe {
            libc::openat(
                parent.raw_fd(),
                name.as_ptr(),
                libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let probe = unsafe { File::from_raw_fd(fd) };

        let st = stat_fd(probe.as_raw_fd())?;
        let (id, _inode) = self
            .inodes
            .write()
            .unwrap()
            .get_or_insert(probe, ids_of(&st), st.st_mode);

        debug!(parent = parent_id, name = ?name, inode = id, "lookup");
        Ok(self.entry_from(id, st))
    }

    /// Find the already-known inode behind `parent/name` without opening
    /// it, bumping its lookup count. The caller owes a matching forget.
    fn lookup_name(&self, parent: &Inode, name: &CStr) -> io::Result<(u64, Arc<Inode>)> {
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        let res = unsafe {
            libc::fstatat64(
                parent.raw_fd(),
                name.as_ptr(),
                &mut st,
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        self.inodes
            .write()
            .unwrap()
            .bump_by_ids(ids_of(&st))
            .ok_or_else(eio)
    }

    fn forget_one(&self, id: u64, count: u64) {
        self.inodes.write().unwrap().forget(id, count);
    }

    /// Re-open an inode with real access flags through `/proc/self/fd`.
    fn open_inode(&self, inode: &Inode, flags: libc::c_int) -> io::Result<File> {
        self.proc_self_fd
            .open_fd(inode.raw_fd(), flags & !libc::O_NOFOLLOW)
    }

    fn update_open_flags(&self, flags: libc::c_int) -> libc::c_int {
        // O_DIRECT in the guest does not have to mean bypassing the host
        // page cache.
        let mut flags = flags & !libc::O_DIRECT;

        if self.writeback.load(Ordering::Relaxed) {
            // The guest kernel may service reads from its own cache even
            // on write-only opens, and handles O_APPEND positioning
            // itself.
            if flags & libc::O_ACCMODE == libc::O_WRONLY {
                flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
            }
            flags &= !libc::O_APPEND;
        }
        flags
    }

    fn file_open_options(&self) -> OpenOptions {
        match self.config.cache {
            CachePolicy::None => OpenOptions::DIRECT_IO,
            CachePolicy::Always => OpenOptions::KEEP_CACHE,
            CachePolicy::Auto => OpenOptions::empty(),
        }
    }

    /// Write the guest-supplied security context onto a just-created
    /// object.
    fn apply_secctx(&self, parent: &Inode, name: &CStr, secctx: &SecContext) -> io::Result<()> {
        let fd = unsafe {
            libc::openat(
                parent.raw_fd(),
                name.as_ptr(),
                libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let child = unsafe { File::from_raw_fd(fd) };
        let st = stat_fd(child.as_raw_fd())?;

        match st.st_mode & libc::S_IFMT {
            libc::S_IFREG | libc::S_IFDIR => {
                let opened = self
                    .proc_self_fd
                    .open_fd(child.as_raw_fd(), libc::O_RDONLY)?;
                xattr::fset(opened.as_raw_fd(), &secctx.name, &secctx.value, 0)
            }
            _ => {
                let _cwd = FchdirGuard::enter(&self.proc_self_fd, self.root.raw_fd())?;
                xattr::set_path(
                    &fd_name(child.as_raw_fd()),
                    &secctx.name,
                    &secctx.value,
                    0,
                )
            }
        }
    }

    /// MKNOD, MKDIR and SYMLINK share everything but the creating syscall,
    /// which runs under the caller's identity.
    fn create_node(
        &self,
        ctx: Context,
        parent_id: u64,
        name: &CStr,
        mode: u32,
        rdev: u32,
        link: Option<&CStr>,
        extensions: &Extensions,
    ) -> io::Result<Entry> {
        if !is_safe_name(name) {
            return Err(einval());
        }
        let parent = self.get_inode(parent_id)?;

        {
            let _cred = become_caller(ctx.uid, ctx.gid)?;
            let res = match link {
                Some(link) => unsafe {
                    libc::symlinkat(link.as_ptr(), parent.raw_fd(), name.as_ptr())
                },
                None => match mode & libc::S_IFMT {
                    libc::S_IFDIR => unsafe {
                        libc::mkdirat(parent.raw_fd(), name.as_ptr(), mode as libc::mode_t)
                    },
                    libc::S_IFREG => {
                        // A plain file needs no device number and works
                        // without CAP_MKNOD.
                        let fd = unsafe {
                            libc::openat(
                                parent.raw_fd(),
                                name.as_ptr(),
                                libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY | libc::O_CLOEXEC,
                                libc::c_uint::from(mode as libc::mode_t & 0o7777),
                            )
                        };
                        if fd >= 0 {
                            unsafe { libc::close(fd) };
                        }
                        fd.min(0)
                    }
                    _ => unsafe {
                        libc::mknodat(
                            parent.raw_fd(),
                            name.as_ptr(),
                            mode as libc::mode_t,
                            libc::dev_t::from(rdev),
                        )
                    },
                },
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if let Some(secctx) = &extensions.security_ctx {
            self.apply_secctx(&parent, name, secctx)?;
        }

        self.do_lookup(parent_id, name)
    }
}

impl FileSystem for PassthroughFs {
    fn init(&self, capable: FsOptions) -> io::Result<FsOptions> {
        let mut enabled = capable
            & (FsOptions::ASYNC_READ
                | FsOptions::ASYNC_DIO
                | FsOptions::BIG_WRITES
                | FsOptions::ATOMIC_O_TRUNC
                | FsOptions::EXPORT_SUPPORT
                | FsOptions::PARALLEL_DIROPS
                | FsOptions::HANDLE_KILLPRIV
                | FsOptions::HANDLE_KILLPRIV_V2
                | FsOptions::SETXATTR_EXT
                | FsOptions::SECURITY_CTX);

        let writeback = self.config.writeback && capable.contains(FsOptions::WRITEBACK_CACHE);
        if writeback {
            debug!("activating writeback cache");
            enabled |= FsOptions::WRITEBACK_CACHE;
        }
        self.writeback.store(writeback, Ordering::Relaxed);

        let posix_lock = self.config.posix_lock && capable.contains(FsOptions::POSIX_LOCKS);
        if posix_lock {
            debug!("activating posix locks");
            enabled |= FsOptions::POSIX_LOCKS;
        }
        self.posix_lock.store(posix_lock, Ordering::Relaxed);

        let flock = self.config.flock && capable.contains(FsOptions::FLOCK_LOCKS);
        if flock {
            debug!("activating flock");
            enabled |= FsOptions::FLOCK_LOCKS;
        }
        self.flock_enabled.store(flock, Ordering::Relaxed);

        let readdirplus = self
            .config
            .readdirplus
            .unwrap_or(self.config.cache != CachePolicy::None);
        if readdirplus && capable.contains(FsOptions::DO_READDIRPLUS) {
            enabled |= FsOptions::DO_READDIRPLUS;
            enabled |= capable & FsOptions::READDIRPLUS_AUTO;
        }

        Ok(enabled)
    }

    fn destroy(&self) {
        // Release every outstanding lookup count, and with them any file
        // and directory handles a rebooted guest never got to close.
        self.inodes.write().unwrap().drain();
        *self.file_handles.write().unwrap() = Slab::new();
        *self.dir_handles.write().unwrap() = Slab::new();
    }

    fn lookup(&self, _ctx: Context, parent: u64, name: &CString) -> io::Result<Entry> {
        // "." and ".." stay legal here for export support; embedded
        // slashes never are.
        if name.to_bytes().contains(&b'/') {
            return Err(einval());
        }
        self.do_lookup(parent, name)
    }

    fn forget(&self, _ctx: Context, inode: u64, count: u64) {
        self.forget_one(inode, count);
    }

    fn getattr(
        &self,
        _ctx: Context,
        inode: u64,
        _handle: Option<u64>,
    ) -> io::Result<(libc::stat64, Duration)> {
        let inode = self.get_inode(inode)?;
        Ok((stat_fd(inode.raw_fd())?, self.timeout))
    }

    fn setattr(
        &self,
        _ctx: Context,
        inode_id: u64,
        attr: libc::stat64,
        handle: Option<u64>,
        valid: SetattrValid,
    ) -> io::Result<(libc::stat64, Duration)> {
        let inode = self.get_inode(inode_id)?;
        let handle_data = match handle {
            Some(h) => Some(self.get_handle(h)?),
            None => None,
        };

        if valid.contains(SetattrValid::MODE) {
            let res = match &handle_data {
                Some(hd) => unsafe { libc::fchmod(hd.raw_fd(), attr.st_mode) },
                None => unsafe {
                    libc::fchmodat(
                        self.proc_self_fd.as_raw_fd(),
                        fd_name(inode.raw_fd()).as_ptr(),
                        attr.st_mode,
                        0,
                    )
                },
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if valid.intersects(SetattrValid::UID | SetattrValid::GID) {
            let uid = if valid.contains(SetattrValid::UID) {
                attr.st_uid
            } else {
                libc::uid_t::MAX
            };
            let gid = if valid.contains(SetattrValid::GID) {
                attr.st_gid
            } else {
                libc::gid_t::MAX
            };
            let res = unsafe {
                libc::fchownat(
                    inode.raw_fd(),
                    c"".as_ptr(),
                    uid,
                    gid,
                    libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
                )
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if valid.contains(SetattrValid::SIZE) {
            // Truncation needs a writable descriptor; open one when the
            // guest did not supply a handle.
            let ephemeral;
            let fd = match &handle_data {
                Some(hd) => hd.raw_fd(),
                None => {
                    ephemeral = self.open_inode(&inode, libc::O_RDWR)?;
                    ephemeral.as_raw_fd()
                }
            };
            if unsafe { libc::ftruncate64(fd, attr.st_size) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if valid.intersects(SetattrValid::ATIME | SetattrValid::MTIME) {
            let mut tv = [
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
            ];
            if valid.contains(SetattrValid::ATIME_NOW) {
                tv[0].tv_nsec = libc::UTIME_NOW;
            } else if valid.contains(SetattrValid::ATIME) {
                tv[0].tv_sec = attr.st_atime;
                tv[0].tv_nsec = attr.st_atime_nsec;
            }
            if valid.contains(SetattrValid::MTIME_NOW) {
                tv[1].tv_nsec = libc::UTIME_NOW;
            } else if valid.contains(SetattrValid::MTIME) {
                tv[1].tv_sec = attr.st_mtime;
                tv[1].tv_nsec = attr.st_mtime_nsec;
            }

            let res = match &handle_data {
                Some(hd) => unsafe { libc::futimens(hd.raw_fd(), tv.as_ptr()) },
                None => unsafe {
                    libc::utimensat(
                        self.proc_self_fd.as_raw_fd(),
                        fd_name(inode.raw_fd()).as_ptr(),
                        tv.as_ptr(),
                        0,
                    )
                },
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok((stat_fd(inode.raw_fd())?, self.timeout))
    }

    fn readlink(&self, _ctx: Context, inode: u64) -> io::Result<Vec<u8>> {
        let inode = self.get_inode(inode)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
        let res = unsafe {
            libc::readlinkat(
                inode.raw_fd(),
                c"".as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        if res as usize == buf.len() {
            return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
        }
        buf.truncate(res as usize);
        Ok(buf)
    }

    fn symlink(
        &self,
        ctx: Context,
        linkname: &CString,
        parent: u64,
        name: &CString,
        extensions: Extensions,
    ) -> io::Result<Entry> {
        self.create_node(ctx, parent, name, 0, 0, Some(linkname), &extensions)
    }

    fn mknod(
        &self,
        ctx: Context,
        parent: u64,
        name: &CString,
        mode: u32,
        rdev: u32,
        _umask: u32,
        extensions: Extensions,
    ) -> io::Result<Entry> {
        self.create_node(ctx, parent, name, mode, rdev, None, &extensions)
    }

    fn mkdir(
        &self,
        ctx: Context,
        parent: u64,
        name: &CString,
        mode: u32,
        _umask: u32,
        extensions: Extensions,
    ) -> io::Result<Entry> {
        self.create_node(
            ctx,
            parent,
            name,
            libc::S_IFDIR | mode,
            0,
            None,
            &extensions,
        )
    }

    fn unlink(&self, _ctx: Context, parent: u64, name: &CString) -> io::Result<()> {
        if !is_safe_name(name) {
            return Err(einval());
        }
        let parent_inode = self.get_inode(parent)?;
        let (child_id, _child) = self.lookup_name(&parent_inode, name).map_err(|_| eio())?;

        let res = unsafe { libc::unlinkat(parent_inode.raw_fd(), name.as_ptr(), 0) };
        // Balance the lookup_name bump whether or not the unlink stuck.
        self.forget_one(child_id, 1);
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn rmdir(&self, _ctx: Context, parent: u64, name: &CString) -> io::Result<()> {
        if !is_safe_name(name) {
            return Err(einval());
        }
        let parent_inode = self.get_inode(parent)?;
        let (child_id, _child) = self.lookup_name(&parent_inode, name).map_err(|_| eio())?;

        let res = unsafe {
            libc::unlinkat(parent_inode.raw_fd(), name.as_ptr(), libc::AT_REMOVEDIR)
        };
        self.forget_one(child_id, 1);
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn rename(
        &self,
        _ctx: Context,
        olddir: u64,
        oldname: &CString,
        newdir: u64,
        newname: &CString,
        flags: u32,
    ) -> io::Result<()> {
        if !is_safe_name(oldname) || !is_safe_name(newname) {
            return Err(einval());
        }
        let old_parent = self.get_inode(olddir)?;
        let new_parent = self.get_inode(newdir)?;

        // Pin both affected inodes so concurrent forgets cannot retire
        // them mid-rename; the target may legitimately not exist.
        let (old_id, _old) = self.lookup_name(&old_parent, oldname).map_err(|_| eio())?;
        let overwritten = self.lookup_name(&new_parent, newname).ok();

        let res = if flags == 0 {
            unsafe {
                libc::renameat(
                    old_parent.raw_fd(),
                    oldname.as_ptr(),
                    new_parent.raw_fd(),
                    newname.as_ptr(),
                )
            }
        } else {
            let res = unsafe {
                libc::syscall(
                    libc::SYS_renameat2,
                    old_parent.raw_fd(),
                    oldname.as_ptr(),
                    new_parent.raw_fd(),
                    newname.as_ptr(),
                    flags,
                )
            } as libc::c_int;
            if res < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ENOSYS) {
                self.forget_one(old_id, 1);
                if let Some((new_id, _)) = overwritten {
                    self.forget_one(new_id, 1);
                }
                return Err(einval());
            }
            res
        };

        self.forget_one(old_id, 1);
        if let Some((new_id, _)) = overwritten {
            self.forget_one(new_id, 1);
        }

        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn link(
        &self,
        _ctx: Context,
        inode_id: u64,
        newparent: u64,
        newname: &CString,
    ) -> io::Result<Entry> {
        if !is_safe_name(newname) {
            return Err(einval());
        }
        let inode = self.get_inode(inode_id)?;
        let parent = self.get_inode(newparent)?;

        let res = unsafe {
            libc::linkat(
                self.proc_self_fd.as_raw_fd(),
                fd_name(inode.raw_fd()).as_ptr(),
                parent.raw_fd(),
                newname.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        let st = stat_fd(inode.raw_fd())?;
        // The same inode is handed to the guest once more.
        self.inodes.write().unwrap().bump(inode_id);
        Ok(self.entry_from(inode_id, st))
    }

    fn open(
        &self,
        _ctx: Context,
        inode_id: u64,
        flags: u32,
        fuse_flags: u32,
    ) -> io::Result<(Option<u64>, OpenOptions)> {
        let flags = flags as libc::c_int;
        if flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE {
            // Creation travels through CREATE/MKNOD, never OPEN.
            return Err(einval());
        }
        let inode = self.get_inode(inode_id)?;

        let _killpriv = if fuse_flags & OPEN_KILL_SUIDGID != 0 {
            drop_fsetid()?
        } else {
            None
        };

        let flags = self.update_open_flags(flags);
        let file = self.open_inode(&inode, flags)?;
        let handle = self
            .file_handles
            .write()
            .unwrap()
            .insert(Arc::new(HandleData::new(inode_id, file))) as u64;

        debug!(inode = inode_id, handle, flags, "open");
        Ok((Some(handle), self.file_open_options()))
    }

    fn create(
        &self,
        ctx: Context,
        parent_id: u64,
        name: &CString,
        mode: u32,
        flags: u32,
        _umask: u32,
        fuse_flags: u32,
        extensions: Extensions,
    ) -> io::Result<(Entry, Option<u64>, OpenOptions)> {
        if !is_safe_name(name) {
            return Err(einval());
        }
        let parent = self.get_inode(parent_id)?;

        let _killpriv = if fuse_flags & OPEN_KILL_SUIDGID != 0 {
            drop_fsetid()?
        } else {
            None
        };

        let flags = self.update_open_flags(flags as libc::c_int);
        let file = {
            let _cred = become_caller(ctx.uid, ctx.gid)?;
            let fd = unsafe {
                libc::openat(
                    parent.raw_fd(),
                    name.as_ptr(),
                    (flags | libc::O_CREAT | libc::O_CLOEXEC) & !libc::O_NOFOLLOW,
                    libc::c_uint::from(mode as libc::mode_t),
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            unsafe { File::from_raw_fd(fd) }
        };

        if let Some(secctx) = &extensions.security_ctx {
            self.apply_secctx(&parent, name, secctx)?;
        }

        let entry = self.do_lookup(parent_id, name)?;
        let handle = self
            .file_handles
            .write()
            .unwrap()
            .insert(Arc::new(HandleData::new(entry.inode, file))) as u64;

        Ok((entry, Some(handle), self.file_open_options()))
    }

    fn read(
        &self,
        _ctx: Context,
        _inode: u64,
        handle: u64,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let hd = self.get_handle(handle)?;
        w.write_from_file_at(hd.raw_fd(), size as usize, offset)
    }

    fn write(
        &self,
        _ctx: Context,
        _inode: u64,
        handle: u64,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        kill_priv: bool,
        _flags: u32,
    ) -> io::Result<usize> {
        let hd = self.get_handle(handle)?;

        // Without CAP_FSETID the kernel clears suid/sgid as the data
        // lands, which is what the guest asked for.
        let _killpriv = if kill_priv { drop_fsetid()? } else { None };

        r.read_to_file_at(hd.raw_fd(), size as usize, offset)
    }

    fn flush(&self, _ctx: Context, inode: u64, handle: u64, lock_owner: u64) -> io::Result<()> {
        let inode = self.get_inode(inode)?;

        // A guest descriptor is going away: its owner's POSIX locks die
        // with it.
        locks::release_records(&inode, lock_owner);

        let hd = self.get_handle(handle)?;
        let fd = unsafe { libc::dup(hd.raw_fd()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Closing a dup forces the data-committing close semantics without
        // giving up the handle.
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn fsync(
        &self,
        _ctx: Context,
        inode: u64,
        datasync: bool,
        handle: Option<u64>,
    ) -> io::Result<()> {
        let ephemeral;
        let hd;
        let fd = match handle {
            Some(h) => {
                hd = self.get_handle(h)?;
                hd.raw_fd()
            }
            None => {
                let inode = self.get_inode(inode)?;
                ephemeral = self.open_inode(&inode, libc::O_RDWR)?;
                ephemeral.as_raw_fd()
            }
        };

        let res = if datasync {
            unsafe { libc::fdatasync(fd) }
        } else {
            unsafe { libc::fsync(fd) }
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn release(
        &self,
        _ctx: Context,
        _inode: u64,
        _flags: u32,
        handle: u64,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        // Dropping the handle closes the descriptor, which also releases
        // any flock the guest held through it.
        self.file_handles
            .write()
            .unwrap()
            .remove(handle as usize)
            .map(|_| ())
            .ok_or_else(ebadf)
    }

    fn statfs(&self, _ctx: Context, inode: u64) -> io::Result<libc::statvfs64> {
        let inode = self.get_inode(inode)?;
        let mut st: libc::statvfs64 = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstatvfs64(inode.raw_fd(), &mut st) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(st)
    }

    fn setxattr(
        &self,
        _ctx: Context,
        inode: u64,
        name: &CString,
        value: &[u8],
        flags: u32,
        extra_flags: u32,
    ) -> io::Result<()> {
        if !self.config.xattr {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let inode = self.get_inode(inode)?;

        // An ACL grant may oblige us to clear sgid, same as a kill-priv
        // write.
        let _killpriv = if extra_flags & SETXATTR_ACL_KILL_SGID != 0 {
            drop_fsetid()?
        } else {
            None
        };

        if inode.is_reg_or_dir() {
            let file = self.open_inode(&inode, libc::O_RDONLY)?;
            xattr::fset(file.as_raw_fd(), name, value, flags as libc::c_int)
        } else {
            let _cwd = FchdirGuard::enter(&self.proc_self_fd, self.root.raw_fd())?;
            xattr::set_path(
                &fd_name(inode.raw_fd()),
                name,
                value,
                flags as libc::c_int,
            )
        }
    }

    fn getxattr(
        &self,
        _ctx: Context,
        inode: u64,
        name: &CString,
        size: u32,
    ) -> io::Result<GetxattrReply> {
        if !self.config.xattr {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let inode = self.get_inode(inode)?;

        let mut buf = vec![0u8; size as usize];
        let count = if inode.is_reg_or_dir() {
            let file = self.open_inode(&inode, libc::O_RDONLY)?;
            xattr::fget(file.as_raw_fd(), name, &mut buf)?
        } else {
            let _cwd = FchdirGuard::enter(&self.proc_self_fd, self.root.raw_fd())?;
            xattr::get_path(&fd_name(inode.raw_fd()), name, &mut buf)?
        };

        if size == 0 {
            Ok(GetxattrReply::Count(count as u32))
        } else {
            buf.truncate(count);
            Ok(GetxattrReply::Value(buf))
        }
    }

    fn listxattr(&self, _ctx: Context, inode: u64, size: u32) -> io::Result<ListxattrReply> {
        if !self.config.xattr {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let inode = self.get_inode(inode)?;

        let mut buf = vec![0u8; size as usize];
        let count = if inode.is_reg_or_dir() {
            let file = self.open_inode(&inode, libc::O_RDONLY)?;
            xattr::flist(file.as_raw_fd(), &mut buf)?
        } else {
            let _cwd = FchdirGuard::enter(&self.proc_self_fd, self.root.raw_fd())?;
            xattr::list_path(&fd_name(inode.raw_fd()), &mut buf)?
        };

        if size == 0 {
            Ok(ListxattrReply::Count(count as u32))
        } else {
            buf.truncate(count);
            Ok(ListxattrReply::Names(buf))
        }
    }

    fn removexattr(&self, _ctx: Context, inode: u64, name: &CString) -> io::Result<()> {
        if !self.config.xattr {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let inode = self.get_inode(inode)?;

        if inode.is_reg_or_dir() {
            let file = self.open_inode(&inode, libc::O_RDONLY)?;
            xattr::fremove(file.as_raw_fd(), name)
        } else {
            let _cwd = FchdirGuard::enter(&self.proc_self_fd, self.root.raw_fd())?;
            xattr::remove_path(&fd_name(inode.raw_fd()), name)
        }
    }

    fn opendir(
        &self,
        _ctx: Context,
        inode_id: u64,
        _flags: u32,
    ) -> io::Result<(Option<u64>, OpenOptions)> {
        let inode = self.get_inode(inode_id)?;

        let fd = unsafe {
            libc::openat(
                inode.raw_fd(),
                c".".as_ptr(),
                libc::O_RDONLY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let stream = DirStream::from_file(unsafe { File::from_raw_fd(fd) })?;

        let handle = self.dir_handles.write().unwrap().insert(Arc::new(stream)) as u64;

        let opts = if self.config.cache == CachePolicy::Always {
            OpenOptions::CACHE_DIR
        } else {
            OpenOptions::empty()
        };
        Ok((Some(handle), opts))
    }

    fn readdir(
        &self,
        _ctx: Context,
        inode: u64,
        handle: u64,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let dinode = self.get_inode(inode)?;
        let stream = self.get_dir(handle)?;
        let root = Arc::ptr_eq(&dinode, &self.root);

        stream.for_each_from(offset as i64, |ent| {
            let (ino, type_) = if root && ent.name == b".." {
                // The root's parent is the root itself.
                (self.root.ids().ino, u32::from(libc::DT_DIR))
            } else {
                (ent.ino, ent.type_)
            };

            let written = add_entry(DirEntry {
                ino,
                offset: ent.off as u64,
                type_,
                name: &ent.name,
            })?;
            Ok(written > 0)
        })
    }

    fn readdirplus(
        &self,
        _ctx: Context,
        inode: u64,
        handle: u64,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry, Entry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let dinode = self.get_inode(inode)?;
        let stream = self.get_dir(handle)?;
        let root = Arc::ptr_eq(&dinode, &self.root);

        stream.for_each_from(offset as i64, |ent| {
            let dot = ent.name == b"." || ent.name == b"..";
            let (ino, type_) = if root && ent.name == b".." {
                (self.root.ids().ino, u32::from(libc::DT_DIR))
            } else {
                (ent.ino, ent.type_)
            };

            let (entry, looked_up) = if dot {
                // Dot entries carry attributes only; no lookup count moves.
                let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
                st.st_ino = ino;
                st.st_mode = type_ << 12;
                (
                    Entry {
                        inode: 0,
                        generation: 0,
                        attr: st,
                        attr_timeout: Duration::ZERO,
                        entry_timeout: Duration::ZERO,
                    },
                    None,
                )
            } else {
                let name = CString::new(ent.name.clone()).map_err(|_| einval())?;
                let entry = self.do_lookup(inode, &name)?;
                let child = entry.inode;
                (entry, Some(child))
            };

            let written = add_entry(
                DirEntry {
                    ino,
                    offset: ent.off as u64,
                    type_,
                    name: &ent.name,
                },
                entry,
            )?;

            if written == 0 {
                // The entry did not fit; take back the lookup count the
                // guest will never see.
                if let Some(child) = looked_up {
                    self.forget_one(child, 1);
                }
                return Ok(false);
            }
            Ok(true)
        })
    }

    fn releasedir(&self, _ctx: Context, _inode: u64, _flags: u32, handle: u64) -> io::Result<()> {
        // Concurrent readers hold their own Arc; the stream closes when
        // the last one finishes.
        self.dir_handles
            .write()
            .unwrap()
            .remove(handle as usize)
            .map(|_| ())
            .ok_or_else(ebadf)
    }

    fn fsyncdir(
        &self,
        _ctx: Context,
        _inode: u64,
        datasync: bool,
        handle: Option<u64>,
    ) -> io::Result<()> {
        let stream = self.get_dir(handle.ok_or_else(ebadf)?)?;
        let fd = stream.raw_fd();

        let res = if datasync {
            unsafe { libc::fdatasync(fd) }
        } else {
            unsafe { libc::fsync(fd) }
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn getlk(
        &self,
        _ctx: Context,
        inode: u64,
        _handle: u64,
        owner: u64,
        lock: FileLock,
    ) -> io::Result<FileLock> {
        if !self.posix_lock.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let inode = self.get_inode(inode)?;
        let record = locks::acquire_record(&inode, &self.proc_self_fd, owner)?;

        let mut fl = locks::flock_from_wire(&lock);
        locks::get_ofd_lock(record.raw_fd(), &mut fl)?;
        Ok(locks::flock_to_wire(&fl))
    }

    fn setlk(
        &self,
        _ctx: Context,
        inode: u64,
        _handle: u64,
        owner: u64,
        lock: FileLock,
        sleep: bool,
    ) -> io::Result<()> {
        if !self.posix_lock.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        if sleep {
            // A blocking lock would park a worker thread indefinitely.
            return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
        }
        let inode = self.get_inode(inode)?;
        let record = locks::acquire_record(&inode, &self.proc_self_fd, owner)?;

        let fl = locks::flock_from_wire(&lock);
        locks::set_ofd_lock(record.raw_fd(), &fl)
    }

    fn flock(&self, _ctx: Context, _inode: u64, handle: u64, operation: i32) -> io::Result<()> {
        if !self.flock_enabled.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let hd = self.get_handle(handle)?;
        if unsafe { libc::flock(hd.raw_fd(), operation) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn fallocate(
        &self,
        _ctx: Context,
        _inode: u64,
        handle: u64,
        mode: u32,
        offset: u64,
        length: u64,
    ) -> io::Result<()> {
        let hd = self.get_handle(handle)?;
        let res = unsafe {
            libc::fallocate64(
                hd.raw_fd(),
                mode as libc::c_int,
                offset as libc::off64_t,
                length as libc::off64_t,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn lseek(
        &self,
        _ctx: Context,
        _inode: u64,
        handle: u64,
        offset: u64,
        whence: u32,
    ) -> io::Result<u64> {
        let hd = self.get_handle(handle)?;
        let res = unsafe {
            libc::lseek64(hd.raw_fd(), offset as libc::off64_t, whence as libc::c_int)
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as u64)
    }

    fn copy_file_range(
        &self,
        _ctx: Context,
        _inode_in: u64,
        handle_in: u64,
        offset_in: u64,
        _inode_out: u64,
        handle_out: u64,
        offset_out: u64,
        len: u64,
        flags: u64,
    ) -> io::Result<usize> {
        let hd_in = self.get_handle(handle_in)?;
        let hd_out = self.get_handle(handle_out)?;

        let mut off_in = offset_in as libc::off64_t;
        let mut off_out = offset_out as libc::off64_t;
        let res = unsafe {
            libc::copy_file_range(
                hd_in.raw_fd(),
                &mut off_in,
                hd_out.raw_fd(),
                &mut off_out,
                len as usize,
                flags as libc::c_uint,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }
}
