//! Request dispatcher: one FUSE message in, one reply out.
//!
//! [`Server`] owns the session state and a [`FileSystem`]. The transport
//! layer hands it a [`Reader`]/[`Writer`] pair per popped descriptor chain;
//! `handle_message` parses the header, gates the request on session state,
//! invokes the filesystem and composes the reply. Replies to different
//! requests may be produced on any thread in any order.

use std::io::{Read, Write};
use std::mem::size_of;
use std::sync::RwLock;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, error, warn};
use vm_memory::ByteValued;

use crate::abi::*;
use crate::buffer::{Reader, Writer};
use crate::filesystem::{Context, DirEntry, Entry, Extensions, FileSystem, GetxattrReply, ListxattrReply, SecContext};
use crate::{Error, Result};

/// Largest WRITE payload the server accepts, advertised in the INIT reply.
pub const MAX_WRITE_SIZE: u32 = 1 << 20;

/// `max_pages` matching [`MAX_WRITE_SIZE`] (4 KiB pages).
const MAX_PAGES: u16 = (MAX_WRITE_SIZE / 4096) as u16;

const MAX_BACKGROUND: u16 = 64;
const CONGESTION_THRESHOLD: u16 = 48;

#[derive(Debug, Default)]
struct SessionState {
    initialized: bool,
    destroyed: bool,
    proto_major: u32,
    proto_minor: u32,
    options: FsOptions,
}

/// FUSE session dispatcher over a [`FileSystem`].
pub struct Server<F: FileSystem> {
    fs: F,
    /// Serializes INIT/DESTROY (write side) against request handlers
    /// (read side).
    session: RwLock<SessionState>,
    /// Unique ids the guest asked to interrupt. Best-effort: handlers are
    /// not preempted, the set only keeps the ids from outliving their
    /// requests.
    interrupted: DashSet<u64>,
}

impl<F: FileSystem> Server<F> {
    pub fn new(fs: F) -> Server<F> {
        Server {
            fs,
            session: RwLock::new(SessionState::default()),
            interrupted: DashSet::new(),
        }
    }

    /// The wrapped filesystem.
    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    /// Negotiated session capabilities (empty before INIT).
    pub fn options(&self) -> FsOptions {
        self.session.read().unwrap().options
    }

    /// Client protocol version as of the last INIT.
    pub fn protocol_version(&self) -> (u32, u32) {
        let session = self.session.read().unwrap();
        (session.proto_major, session.proto_minor)
    }

    /// Tear the session down outside of a DESTROY message (transport
    /// shutdown). Outstanding lookup counts are released.
    pub fn destroy(&self) {
        let mut session = self.session.write().unwrap();
        if session.initialized && !session.destroyed {
            self.fs.destroy();
            session.destroyed = true;
        }
    }

    /// Process one request chain. Returns the number of reply bytes
    /// written; zero for no-reply messages (FORGET, INTERRUPT).
    pub fn handle_message(&self, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let in_header: InHeader = r.read_obj().map_err(Error::DecodeMessage)?;
        if (in_header.len as usize) < size_of::<InHeader>() {
            return Err(Error::InvalidHeaderLength(in_header.len));
        }

        let opcode = Opcode::from(in_header.opcode);
        debug!(
            opcode = ?opcode,
            unique = in_header.unique,
            nodeid = in_header.nodeid,
            "request"
        );

        let res = match opcode {
            Opcode::Init => self.init(in_header, r, w),
            Opcode::Destroy => self.do_destroy(in_header, w),
            _ => self.dispatch(opcode, in_header, r, w),
        };

        // A completed request can no longer be interrupted.
        self.interrupted.remove(&in_header.unique);
        res
    }

    fn dispatch(
        &self,
        opcode: Opcode,
        in_header: InHeader,
        r: Reader<'_>,
        w: Writer<'_>,
    ) -> Result<usize> {
        let session = self.session.read().unwrap();
        if !session.initialized || session.destroyed {
            warn!(opcode = ?opcode, "request before INIT or after DESTROY");
            // No-reply messages stay no-reply even when refused.
            if matches!(
                opcode,
                Opcode::Forget | Opcode::BatchForget | Opcode::Interrupt
            ) {
                return Ok(0);
            }
            return self.reply_error(io_err(libc::EIO), in_header.unique, w);
        }
        let options = session.options;
        drop(session);

        match opcode {
            Opcode::Lookup => self.lookup(in_header, r, w),
            Opcode::Forget => self.forget(in_header, r),
            Opcode::BatchForget => self.batch_forget(in_header, r),
            Opcode::Getattr => self.getattr(in_header, r, w),
            Opcode::Setattr => self.setattr(in_header, r, w),
            Opcode::Readlink => self.readlink(in_header, w),
            Opcode::Symlink => self.symlink(in_header, r, w, options),
            Opcode::Mknod => self.mknod(in_header, r, w, options),
            Opcode::Mkdir => self.mkdir(in_header, r, w, options),
            Opcode::Unlink => self.unlink(in_header, r, w),
            Opcode::Rmdir => self.rmdir(in_header, r, w),
            Opcode::Rename => self.rename(in_header, r, w),
            Opcode::Rename2 => self.rename2(in_header, r, w),
            Opcode::Link => self.link(in_header, r, w),
            Opcode::Open => self.open(in_header, r, w),
            Opcode::Create => self.create(in_header, r, w, options),
            Opcode::Read => self.read(in_header, r, w),
            Opcode::Write => self.write(in_header, r, w),
            Opcode::Statfs => self.statfs(in_header, w),
            Opcode::Release => self.release(in_header, r, w),
            Opcode::Flush => self.flush(in_header, r, w),
            Opcode::Fsync => self.fsync(in_header, r, w),
            Opcode::Fsyncdir => self.fsyncdir(in_header, r, w),
            Opcode::Setxattr => self.setxattr(in_header, r, w, options),
            Opcode::Getxattr => self.getxattr(in_header, r, w),
            Opcode::Listxattr => self.listxattr(in_header, r, w),
            Opcode::Removexattr => self.removexattr(in_header, r, w),
            Opcode::Opendir => self.opendir(in_header, r, w),
            Opcode::Readdir => self.do_readdir(in_header, r, w, false),
            Opcode::Readdirplus => self.do_readdir(in_header, r, w, true),
            Opcode::Releasedir => self.releasedir(in_header, r, w),
            Opcode::Getlk => self.getlk(in_header, r, w),
            Opcode::Setlk => self.do_setlk(in_header, r, w, false),
            Opcode::Setlkw => self.do_setlk(in_header, r, w, true),
            Opcode::Access => self.access(in_header, r, w),
            Opcode::Interrupt => self.interrupt(r),
            Opcode::Fallocate => self.fallocate(in_header, r, w),
            Opcode::Lseek => self.lseek(in_header, r, w),
            Opcode::CopyFileRange => self.copy_file_range(in_header, r, w),
            Opcode::NotifyReply => Ok(0),
            Opcode::Init | Opcode::Destroy => unreachable!("handled by caller"),
            Opcode::Bmap
            | Opcode::Ioctl
            | Opcode::Poll
            | Opcode::SetupMapping
            | Opcode::RemoveMapping
            | Opcode::Syncfs
            | Opcode::Unknown => self.reply_error(io_err(libc::ENOSYS), in_header.unique, w),
        }
    }

    // ------------------------------------------------------------------
    // Session control
    // ------------------------------------------------------------------

    fn init(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: InitIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        let mut session = self.session.write().unwrap();

        if arg.major < KERNEL_VERSION
            || (arg.major == KERNEL_VERSION && arg.minor < MIN_KERNEL_MINOR_VERSION)
        {
            error!(
                major = arg.major,
                minor = arg.minor,
                "unsupported protocol version"
            );
            return self.reply_error(io_err(libc::EPROTO), in_header.unique, w);
        }

        if arg.major > KERNEL_VERSION {
            // Wait for the client to settle on our version with a second
            // INIT; reply carries only the version numbers.
            let out = InitOut {
                major: KERNEL_VERSION,
                minor: KERNEL_MINOR_VERSION,
                ..InitOut::default()
            };
            return self.reply_ok(Some(out), None, in_header.unique, w);
        }

        // A second INIT arrives after a guest reboot; the reboot lost every
        // FORGET the old kernel owed us, so drain the table first.
        if session.initialized && !session.destroyed {
            debug!("re-INIT on live session, draining");
            self.fs.destroy();
        }

        let capable =
            FsOptions::from_bits_truncate(u64::from(arg.flags) | u64::from(arg.flags2) << 32);

        let mut enabled = match self.fs.init(capable) {
            Ok(enabled) => enabled,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };
        if capable.contains(FsOptions::MAX_PAGES) {
            enabled |= FsOptions::MAX_PAGES;
        }
        if capable.contains(FsOptions::INIT_EXT) {
            enabled |= FsOptions::INIT_EXT;
        }

        session.proto_major = arg.major;
        session.proto_minor = arg.minor;
        session.options = enabled;
        session.initialized = true;
        session.destroyed = false;

        let out = InitOut {
            major: KERNEL_VERSION,
            minor: KERNEL_MINOR_VERSION,
            max_readahead: arg.max_readahead,
            flags: enabled.bits() as u32,
            max_background: MAX_BACKGROUND,
            congestion_threshold: CONGESTION_THRESHOLD,
            max_write: MAX_WRITE_SIZE,
            time_gran: 1,
            max_pages: MAX_PAGES,
            map_alignment: 0,
            flags2: (enabled.bits() >> 32) as u32,
            ..InitOut::default()
        };
        self.reply_ok(Some(out), None, in_header.unique, w)
    }

    fn do_destroy(&self, in_header: InHeader, w: Writer<'_>) -> Result<usize> {
        let mut session = self.session.write().unwrap();
        if session.initialized && !session.destroyed {
            self.fs.destroy();
        }
        session.destroyed = true;
        drop(session);
        self.reply_ok(None::<u8>, None, in_header.unique, w)
    }

    // ------------------------------------------------------------------
    // Inode lifetime
    // ------------------------------------------------------------------

    fn lookup(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let name = match r.read_cstring() {
            Ok(name) => name,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.lookup(ctx(&in_header), in_header.nodeid, &name) {
            Ok(entry) => self.reply_ok(Some(entry_out(entry)), None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn forget(&self, in_header: InHeader, mut r: Reader<'_>) -> Result<usize> {
        if let Ok(ForgetIn { nlookup }) = r.read_obj::<ForgetIn>() {
            self.fs.forget(ctx(&in_header), in_header.nodeid, nlookup);
        }
        // FORGET never gets a reply, even on a parse error.
        Ok(0)
    }

    fn batch_forget(&self, in_header: InHeader, mut r: Reader<'_>) -> Result<usize> {
        if let Ok(BatchForgetIn { count, .. }) = r.read_obj::<BatchForgetIn>() {
            let mut requests = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                match r.read_obj::<ForgetOne>() {
                    Ok(one) => requests.push((one.nodeid, one.nlookup)),
                    Err(_) => break,
                }
            }
            self.fs.batch_forget(ctx(&in_header), requests);
        }
        Ok(0)
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    fn getattr(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: GetattrIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };
        let handle = (arg.flags & GETATTR_FH != 0).then_some(arg.fh);

        match self.fs.getattr(ctx(&in_header), in_header.nodeid, handle) {
            Ok((st, timeout)) => {
                self.reply_ok(Some(attr_out(st, timeout)), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn setattr(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: SetattrIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        let valid = SetattrValid::from_bits_truncate(arg.valid);
        let handle = valid.contains(SetattrValid::FH).then_some(arg.fh);

        // Repackage the wire fields as a stat so the filesystem deals in
        // one attribute type.
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        st.st_mode = arg.mode;
        st.st_uid = arg.uid;
        st.st_gid = arg.gid;
        st.st_size = arg.size as i64;
        st.st_atime = arg.atime as i64;
        st.st_atime_nsec = i64::from(arg.atimensec);
        st.st_mtime = arg.mtime as i64;
        st.st_mtime_nsec = i64::from(arg.mtimensec);
        st.st_ctime = arg.ctime as i64;
        st.st_ctime_nsec = i64::from(arg.ctimensec);

        match self
            .fs
            .setattr(ctx(&in_header), in_header.nodeid, st, handle, valid)
        {
            Ok((st, timeout)) => {
                self.reply_ok(Some(attr_out(st, timeout)), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    fn readlink(&self, in_header: InHeader, w: Writer<'_>) -> Result<usize> {
        match self.fs.readlink(ctx(&in_header), in_header.nodeid) {
            Ok(target) => self.reply_ok(None::<u8>, Some(&target), in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn symlink(
        &self,
        in_header: InHeader,
        mut r: Reader<'_>,
        w: Writer<'_>,
        options: FsOptions,
    ) -> Result<usize> {
        let parsed = r
            .read_cstring()
            .and_then(|name| r.read_cstring().map(|link| (name, link)))
            .and_then(|(name, link)| {
                self.parse_extensions(&mut r, options)
                    .map(|ext| (name, link, ext))
            });
        let (name, linkname, extensions) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.symlink(
            ctx(&in_header),
            &linkname,
            in_header.nodeid,
            &name,
            extensions,
        ) {
            Ok(entry) => self.reply_ok(Some(entry_out(entry)), None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn mknod(
        &self,
        in_header: InHeader,
        mut r: Reader<'_>,
        w: Writer<'_>,
        options: FsOptions,
    ) -> Result<usize> {
        let parsed = r.read_obj::<MknodIn>().and_then(|arg| {
            let name = r.read_cstring()?;
            let ext = self.parse_extensions(&mut r, options)?;
            Ok((arg, name, ext))
        });
        let (arg, name, extensions) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.mknod(
            ctx(&in_header),
            in_header.nodeid,
            &name,
            arg.mode,
            arg.rdev,
            arg.umask,
            extensions,
        ) {
            Ok(entry) => self.reply_ok(Some(entry_out(entry)), None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn mkdir(
        &self,
        in_header: InHeader,
        mut r: Reader<'_>,
        w: Writer<'_>,
        options: FsOptions,
    ) -> Result<usize> {
        let parsed = r.read_obj::<MkdirIn>().and_then(|arg| {
            let name = r.read_cstring()?;
            let ext = self.parse_extensions(&mut r, options)?;
            Ok((arg, name, ext))
        });
        let (arg, name, extensions) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.mkdir(
            ctx(&in_header),
            in_header.nodeid,
            &name,
            arg.mode,
            arg.umask,
            extensions,
        ) {
            Ok(entry) => self.reply_ok(Some(entry_out(entry)), None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn unlink(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let name = match r.read_cstring() {
            Ok(name) => name,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };
        match self.fs.unlink(ctx(&in_header), in_header.nodeid, &name) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn rmdir(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let name = match r.read_cstring() {
            Ok(name) => name,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };
        match self.fs.rmdir(ctx(&in_header), in_header.nodeid, &name) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn rename(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let parsed = r.read_obj::<RenameIn>().and_then(|arg| {
            let oldname = r.read_cstring()?;
            let newname = r.read_cstring()?;
            Ok((arg.newdir, oldname, newname))
        });
        let (newdir, oldname, newname) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.rename(
            ctx(&in_header),
            in_header.nodeid,
            &oldname,
            newdir,
            &newname,
            0,
        ) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn rename2(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let parsed = r.read_obj::<Rename2In>().and_then(|arg| {
            let oldname = r.read_cstring()?;
            let newname = r.read_cstring()?;
            Ok((arg, oldname, newname))
        });
        let (arg, oldname, newname) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.rename(
            ctx(&in_header),
            in_header.nodeid,
            &oldname,
            arg.newdir,
            &newname,
            arg.flags,
        ) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn link(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let parsed = r
            .read_obj::<LinkIn>()
            .and_then(|arg| r.read_cstring().map(|name| (arg.oldnodeid, name)));
        let (oldnodeid, name) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self
            .fs
            .link(ctx(&in_header), oldnodeid, in_header.nodeid, &name)
        {
            Ok(entry) => self.reply_ok(Some(entry_out(entry)), None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    // ------------------------------------------------------------------
    // Open files
    // ------------------------------------------------------------------

    fn open(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: OpenIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self
            .fs
            .open(ctx(&in_header), in_header.nodeid, arg.flags, arg.open_flags)
        {
            Ok((handle, opts)) => {
                let out = OpenOut {
                    fh: handle.unwrap_or(0),
                    open_flags: opts.bits(),
                    ..OpenOut::default()
                };
                self.reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn create(
        &self,
        in_header: InHeader,
        mut r: Reader<'_>,
        w: Writer<'_>,
        options: FsOptions,
    ) -> Result<usize> {
        let parsed = r.read_obj::<CreateIn>().and_then(|arg| {
            let name = r.read_cstring()?;
            let ext = self.parse_extensions(&mut r, options)?;
            Ok((arg, name, ext))
        });
        let (arg, name, extensions) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.create(
            ctx(&in_header),
            in_header.nodeid,
            &name,
            arg.mode,
            arg.flags,
            arg.umask,
            arg.open_flags,
            extensions,
        ) {
            Ok((entry, handle, opts)) => {
                let open_out = OpenOut {
                    fh: handle.unwrap_or(0),
                    open_flags: opts.bits(),
                    ..OpenOut::default()
                };
                // CREATE replies carry the entry and the open reply back to
                // back in one message.
                let mut combined = [0u8; size_of::<EntryOut>() + size_of::<OpenOut>()];
                combined[..size_of::<EntryOut>()].copy_from_slice(entry_out(entry).as_slice());
                combined[size_of::<EntryOut>()..].copy_from_slice(open_out.as_slice());
                self.reply_ok(None::<u8>, Some(&combined), in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn release(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: ReleaseIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        let flush = arg.release_flags & RELEASE_FLUSH != 0;
        let flock_release = arg.release_flags & RELEASE_FLOCK_UNLOCK != 0;
        let lock_owner = (flush || flock_release).then_some(arg.lock_owner);

        match self.fs.release(
            ctx(&in_header),
            in_header.nodeid,
            arg.flags,
            arg.fh,
            flush,
            flock_release,
            lock_owner,
        ) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn flush(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: FlushIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self
            .fs
            .flush(ctx(&in_header), in_header.nodeid, arg.fh, arg.lock_owner)
        {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    fn read(&self, in_header: InHeader, mut r: Reader<'_>, mut w: Writer<'_>) -> Result<usize> {
        let arg: ReadIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        if w.available_bytes() < size_of::<OutHeader>() + arg.size as usize {
            return self.reply_error(io_err(libc::EINVAL), in_header.unique, w);
        }

        let lock_owner = (arg.read_flags & READ_LOCKOWNER != 0).then_some(arg.lock_owner);

        // Reserve room for the header, then let the filesystem fill the
        // data region straight from its descriptor.
        let mut data_writer = match w.split_at(size_of::<OutHeader>()) {
            Ok(data_writer) => data_writer,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.read(
            ctx(&in_header),
            in_header.nodeid,
            arg.fh,
            &mut data_writer,
            arg.size,
            arg.offset,
            lock_owner,
            arg.flags,
        ) {
            Ok(count) => {
                let out = OutHeader {
                    len: (size_of::<OutHeader>() + count) as u32,
                    error: 0,
                    unique: in_header.unique,
                };
                w.write_obj(out).map_err(Error::EncodeMessage)?;
                Ok(out.len as usize)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn write(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: WriteIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        if r.available_bytes() < arg.size as usize {
            return self.reply_error(io_err(libc::EINVAL), in_header.unique, w);
        }

        let delayed_write = arg.write_flags & WRITE_CACHE != 0;
        let kill_priv = arg.write_flags & WRITE_KILL_SUIDGID != 0;
        let lock_owner = (arg.write_flags & WRITE_LOCKOWNER != 0).then_some(arg.lock_owner);

        match self.fs.write(
            ctx(&in_header),
            in_header.nodeid,
            arg.fh,
            &mut r,
            arg.size,
            arg.offset,
            lock_owner,
            delayed_write,
            kill_priv,
            arg.flags,
        ) {
            Ok(count) => {
                let out = WriteOut {
                    size: count as u32,
                    ..WriteOut::default()
                };
                self.reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn fsync(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: FsyncIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };
        let datasync = arg.fsync_flags & 1 != 0;

        match self
            .fs
            .fsync(ctx(&in_header), in_header.nodeid, datasync, Some(arg.fh))
        {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn fsyncdir(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: FsyncIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };
        let datasync = arg.fsync_flags & 1 != 0;

        match self
            .fs
            .fsyncdir(ctx(&in_header), in_header.nodeid, datasync, Some(arg.fh))
        {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn statfs(&self, in_header: InHeader, w: Writer<'_>) -> Result<usize> {
        match self.fs.statfs(ctx(&in_header), in_header.nodeid) {
            Ok(st) => {
                let out = StatfsOut {
                    st: Kstatfs::from(st),
                };
                self.reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn fallocate(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: FallocateIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.fallocate(
            ctx(&in_header),
            in_header.nodeid,
            arg.fh,
            arg.mode,
            arg.offset,
            arg.length,
        ) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn lseek(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: LseekIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.lseek(
            ctx(&in_header),
            in_header.nodeid,
            arg.fh,
            arg.offset,
            arg.whence,
        ) {
            Ok(offset) => {
                let out = LseekOut { offset };
                self.reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn copy_file_range(
        &self,
        in_header: InHeader,
        mut r: Reader<'_>,
        w: Writer<'_>,
    ) -> Result<usize> {
        let arg: CopyFileRangeIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.copy_file_range(
            ctx(&in_header),
            in_header.nodeid,
            arg.fh_in,
            arg.off_in,
            arg.nodeid_out,
            arg.fh_out,
            arg.off_out,
            arg.len,
            arg.flags,
        ) {
            Ok(count) => {
                let out = WriteOut {
                    size: count as u32,
                    ..WriteOut::default()
                };
                self.reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    // ------------------------------------------------------------------
    // Extended attributes
    // ------------------------------------------------------------------

    fn setxattr(
        &self,
        in_header: InHeader,
        mut r: Reader<'_>,
        w: Writer<'_>,
        options: FsOptions,
    ) -> Result<usize> {
        // The body grew an extra flags word with SETXATTR_EXT.
        let parsed = if options.contains(FsOptions::SETXATTR_EXT) {
            r.read_obj::<SetxattrIn>()
        } else {
            r.read_obj::<SetxattrInCompat>().map(|compat| SetxattrIn {
                size: compat.size,
                flags: compat.flags,
                ..SetxattrIn::default()
            })
        };
        let parsed = parsed.and_then(|arg| {
            let name = r.read_cstring()?;
            let mut value = vec![0u8; arg.size as usize];
            r.read_exact(&mut value)?;
            Ok((arg, name, value))
        });
        let (arg, name, value) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.setxattr(
            ctx(&in_header),
            in_header.nodeid,
            &name,
            &value,
            arg.flags,
            arg.setxattr_flags,
        ) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn getxattr(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let parsed = r
            .read_obj::<GetxattrIn>()
            .and_then(|arg| r.read_cstring().map(|name| (arg, name)));
        let (arg, name) = match parsed {
            Ok(v) => v,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self
            .fs
            .getxattr(ctx(&in_header), in_header.nodeid, &name, arg.size)
        {
            Ok(GetxattrReply::Value(value)) => {
                self.reply_ok(None::<u8>, Some(&value), in_header.unique, w)
            }
            Ok(GetxattrReply::Count(size)) => {
                let out = GetxattrOut {
                    size,
                    ..GetxattrOut::default()
                };
                self.reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn listxattr(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: GetxattrIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.listxattr(ctx(&in_header), in_header.nodeid, arg.size) {
            Ok(ListxattrReply::Names(names)) => {
                self.reply_ok(None::<u8>, Some(&names), in_header.unique, w)
            }
            Ok(ListxattrReply::Count(size)) => {
                let out = GetxattrOut {
                    size,
                    ..GetxattrOut::default()
                };
                self.reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn removexattr(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let name = match r.read_cstring() {
            Ok(name) => name,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.removexattr(ctx(&in_header), in_header.nodeid, &name) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    fn opendir(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: OpenIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.opendir(ctx(&in_header), in_header.nodeid, arg.flags) {
            Ok((handle, opts)) => {
                let out = OpenOut {
                    fh: handle.unwrap_or(0),
                    open_flags: opts.bits(),
                    ..OpenOut::default()
                };
                self.reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn do_readdir(
        &self,
        in_header: InHeader,
        mut r: Reader<'_>,
        w: Writer<'_>,
        plus: bool,
    ) -> Result<usize> {
        let arg: ReadIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        if w.available_bytes() < size_of::<OutHeader>() + arg.size as usize {
            return self.reply_error(io_err(libc::EINVAL), in_header.unique, w);
        }

        let mut buf = vec![0u8; arg.size as usize];
        let mut used = 0usize;

        let res = if plus {
            self.fs.readdirplus(
                ctx(&in_header),
                in_header.nodeid,
                arg.fh,
                arg.size,
                arg.offset,
                &mut |dir_entry, entry| add_dirent(&mut buf, &mut used, dir_entry, Some(entry)),
            )
        } else {
            self.fs.readdir(
                ctx(&in_header),
                in_header.nodeid,
                arg.fh,
                arg.size,
                arg.offset,
                &mut |dir_entry| add_dirent(&mut buf, &mut used, dir_entry, None),
            )
        };

        match res {
            Ok(()) => self.reply_ok(None::<u8>, Some(&buf[..used]), in_header.unique, w),
            // An error after entries were emitted cannot be reported: the
            // guest has no way to unwind the lookups it would never see.
            // Return what was collected.
            Err(_) if used > 0 => self.reply_ok(None::<u8>, Some(&buf[..used]), in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn releasedir(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: ReleaseIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self
            .fs
            .releasedir(ctx(&in_header), in_header.nodeid, arg.flags, arg.fh)
        {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    fn getlk(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: LkIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self
            .fs
            .getlk(ctx(&in_header), in_header.nodeid, arg.fh, arg.owner, arg.lk)
        {
            Ok(lk) => self.reply_ok(Some(LkOut { lk }), None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn do_setlk(
        &self,
        in_header: InHeader,
        mut r: Reader<'_>,
        w: Writer<'_>,
        sleep: bool,
    ) -> Result<usize> {
        let arg: LkIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        let res = if arg.lk_flags & LK_FLOCK != 0 {
            // BSD flock arrives through the lock opcodes with LK_FLOCK set.
            let mut op = match arg.lk.lock_type as i32 {
                libc::F_RDLCK => libc::LOCK_SH,
                libc::F_WRLCK => libc::LOCK_EX,
                libc::F_UNLCK => libc::LOCK_UN,
                _ => return self.reply_error(io_err(libc::EINVAL), in_header.unique, w),
            };
            if !sleep {
                op |= libc::LOCK_NB;
            }
            self.fs.flock(ctx(&in_header), in_header.nodeid, arg.fh, op)
        } else {
            self.fs.setlk(
                ctx(&in_header),
                in_header.nodeid,
                arg.fh,
                arg.owner,
                arg.lk,
                sleep,
            )
        };

        match res {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    // ------------------------------------------------------------------
    // Misc
    // ------------------------------------------------------------------

    fn access(&self, in_header: InHeader, mut r: Reader<'_>, w: Writer<'_>) -> Result<usize> {
        let arg: AccessIn = match r.read_obj() {
            Ok(arg) => arg,
            Err(e) => return self.reply_error(e, in_header.unique, w),
        };

        match self.fs.access(ctx(&in_header), in_header.nodeid, arg.mask) {
            Ok(()) => self.reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => self.reply_error(e, in_header.unique, w),
        }
    }

    fn interrupt(&self, mut r: Reader<'_>) -> Result<usize> {
        if let Ok(InterruptIn { unique }) = r.read_obj::<InterruptIn>() {
            debug!(unique, "interrupt");
            self.interrupted.insert(unique);
        }
        // INTERRUPT itself is never answered.
        Ok(0)
    }

    /// Whether the guest asked to interrupt the request with this id.
    pub fn is_interrupted(&self, unique: u64) -> bool {
        self.interrupted.contains(&unique)
    }

    // ------------------------------------------------------------------
    // Reply composition
    // ------------------------------------------------------------------

    fn reply_ok<T: ByteValued>(
        &self,
        out: Option<T>,
        data: Option<&[u8]>,
        unique: u64,
        mut w: Writer<'_>,
    ) -> Result<usize> {
        let mut len = size_of::<OutHeader>();
        if out.is_some() {
            len += size_of::<T>();
        }
        if let Some(data) = data {
            len += data.len();
        }
        let header = OutHeader {
            len: len as u32,
            error: 0,
            unique,
        };
        w.write_obj(header).map_err(Error::EncodeMessage)?;
        if let Some(out) = out {
            w.write_obj(out).map_err(Error::EncodeMessage)?;
        }
        if let Some(data) = data {
            w.write_all(data).map_err(Error::EncodeMessage)?;
        }
        Ok(len)
    }

    fn reply_error(&self, err: std::io::Error, unique: u64, mut w: Writer<'_>) -> Result<usize> {
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        debug!(unique, errno, "reply error");
        let header = OutHeader {
            len: size_of::<OutHeader>() as u32,
            error: -errno,
            unique,
        };
        w.write_obj(header).map_err(Error::EncodeMessage)?;
        Ok(header.len as usize)
    }

    /// Parse the security context a create-class request may carry after
    /// its regular body.
    fn parse_extensions(
        &self,
        r: &mut Reader<'_>,
        options: FsOptions,
    ) -> std::io::Result<Extensions> {
        if !options.contains(FsOptions::SECURITY_CTX) || r.available_bytes() == 0 {
            return Ok(Extensions::default());
        }

        let header: SecctxHeader = r.read_obj()?;
        match header.nr_secctx {
            0 => return Ok(Extensions::default()),
            // Only a single context is supported today.
            1 => {}
            _ => return Err(io_err(libc::EINVAL)),
        }

        let secctx: Secctx = r.read_obj()?;
        if secctx.size == 0 {
            return Err(io_err(libc::EINVAL));
        }
        let name = r.read_cstring()?;
        let mut value = vec![0u8; secctx.size as usize];
        r.read_exact(&mut value)?;

        Ok(Extensions {
            security_ctx: Some(SecContext { name, value }),
        })
    }
}

fn io_err(errno: i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno)
}

fn ctx(in_header: &InHeader) -> Context {
    Context {
        uid: in_header.uid,
        gid: in_header.gid,
        pid: in_header.pid as libc::pid_t,
    }
}

fn duration_parts(d: Duration) -> (u64, u32) {
    (d.as_secs(), d.subsec_nanos())
}

fn entry_out(entry: Entry) -> EntryOut {
    let (entry_valid, entry_valid_nsec) = duration_parts(entry.entry_timeout);
    let (attr_valid, attr_valid_nsec) = duration_parts(entry.attr_timeout);
    EntryOut {
        nodeid: entry.inode,
        generation: entry.generation,
        entry_valid,
        attr_valid,
        entry_valid_nsec,
        attr_valid_nsec,
        attr: Attr::from(entry.attr),
    }
}

fn attr_out(st: libc::stat64, timeout: Duration) -> AttrOut {
    let (attr_valid, attr_valid_nsec) = duration_parts(timeout);
    AttrOut {
        attr_valid,
        attr_valid_nsec,
        dummy: 0,
        attr: Attr::from(st),
    }
}

/// Append one directory entry (plain or plus) to the reply buffer.
///
/// Returns the padded entry size, or zero without touching the buffer when
/// the entry does not fit.
fn add_dirent(
    buf: &mut [u8],
    used: &mut usize,
    de: DirEntry<'_>,
    entry: Option<Entry>,
) -> std::io::Result<usize> {
    let entry_len = entry.map_or(0, |_| size_of::<EntryOut>());
    let unpadded = entry_len + size_of::<Dirent>() + de.name.len();
    let padded = unpadded.div_ceil(DIRENT_PADDING) * DIRENT_PADDING;
    if *used + padded > buf.len() {
        return Ok(0);
    }

    let mut cursor = *used;
    if let Some(entry) = entry {
        buf[cursor..cursor + entry_len].copy_from_slice(entry_out(entry).as_slice());
        cursor += entry_len;
    }

    let dirent = Dirent {
        ino: de.ino,
        off: de.offset,
        namelen: de.name.len() as u32,
        type_: de.type_,
    };
    buf[cursor..cursor + size_of::<Dirent>()].copy_from_slice(dirent.as_slice());
    cursor += size_of::<Dirent>();
    buf[cursor..cursor + de.name.len()].copy_from_slice(de.name);
    cursor += de.name.len();
    // Zero fill the padding.
    for b in &mut buf[cursor..*used + padded] {
        *b = 0;
    }

    *used += padded;
    Ok(padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dirent_plain() {
        let mut buf = vec![0u8; 64];
        let mut used = 0;
        let de = DirEntry {
            ino: 5,
            offset: 7,
            type_: libc::DT_REG as u32,
            name: b"hello",
        };

        let n = add_dirent(&mut buf, &mut used, de, None).unwrap();
        // 24 byte header + 5 byte name, padded to 8.
        assert_eq!(n, 32);
        assert_eq!(used, 32);
        assert_eq!(&buf[24..29], b"hello");
        assert_eq!(&buf[29..32], &[0, 0, 0]);
    }

    #[test]
    fn test_add_dirent_rejects_when_full() {
        let mut buf = vec![0u8; 16];
        let mut used = 0;
        let de = DirEntry {
            ino: 5,
            offset: 7,
            type_: libc::DT_REG as u32,
            name: b"hello",
        };

        let n = add_dirent(&mut buf, &mut used, de, None).unwrap();
        assert_eq!(n, 0);
        assert_eq!(used, 0);
    }

    #[test]
    fn test_entry_out_carries_timeouts() {
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        st.st_ino = 99;
        let entry = Entry {
            inode: 3,
            generation: 0,
            attr: st,
            attr_timeout: Duration::from_millis(1500),
            entry_timeout: Duration::from_secs(86400),
        };

        let out = entry_out(entry);
        assert_eq!(out.nodeid, 3);
        assert_eq!(out.attr.ino, 99);
        assert_eq!(out.attr_valid, 1);
        assert_eq!(out.attr_valid_nsec, 500_000_000);
        assert_eq!(out.entry_valid, 86400);
        assert_eq!(out.entry_valid_nsec, 0);
    }
}
