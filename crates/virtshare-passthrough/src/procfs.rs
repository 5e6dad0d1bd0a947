//! Access to filesystem objects through `/proc/self/fd`.
//!
//! The server holds every discovered inode as an `O_PATH` descriptor, which
//! names the object without granting I/O on it. When an operation needs a
//! real descriptor it re-opens the object through `/proc/self/fd/<n>`,
//! letting the kernel re-resolve it while identity stays pinned. The dirfd
//! of `/proc/self/fd` is captured once, before the sandbox pivots away the
//! old root where `/proc` lives.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// An `O_PATH` handle on `/proc/self/fd`.
#[derive(Debug)]
pub struct ProcSelfFd {
    dir: File,
}

impl ProcSelfFd {
    /// Open `/proc/self/fd` directly. Only possible while `/proc` is still
    /// visible, i.e. before sandboxing.
    pub fn open() -> io::Result<ProcSelfFd> {
        let fd = unsafe {
            libc::open(
                c"/proc/self/fd".as_ptr(),
                libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ProcSelfFd {
            dir: unsafe { File::from_raw_fd(fd) },
        })
    }

    /// Wrap a dirfd the sandbox captured before pivoting.
    pub fn from_file(dir: File) -> ProcSelfFd {
        ProcSelfFd { dir }
    }

    /// Re-open the object behind `fd` with real access `flags`.
    pub fn open_fd(&self, fd: RawFd, flags: libc::c_int) -> io::Result<File> {
        let name = fd_name(fd);
        let new_fd = unsafe {
            libc::openat(
                self.dir.as_raw_fd(),
                name.as_ptr(),
                flags | libc::O_CLOEXEC,
            )
        };
        if new_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { File::from_raw_fd(new_fd) })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }
}

/// The name of `fd` inside `/proc/self/fd`.
pub fn fd_name(fd: RawFd) -> CString {
    CString::new(fd.to_string()).expect("fd decimal string has no NUL")
}

/// Scoped `fchdir` into `/proc/self/fd`, restored to the filesystem root on
/// drop. Lets a relative path of the numeric fd reach objects that cannot
/// be opened (symlinks, special files).
///
/// Requires the calling thread to have run `unshare(CLONE_FS)`, otherwise
/// the working-directory change leaks to sibling threads.
pub struct FchdirGuard {
    restore_fd: RawFd,
}

impl FchdirGuard {
    pub fn enter(proc_self_fd: &ProcSelfFd, restore_fd: RawFd) -> io::Result<FchdirGuard> {
        if unsafe { libc::fchdir(proc_self_fd.as_raw_fd()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(FchdirGuard { restore_fd })
    }
}

impl Drop for FchdirGuard {
    fn drop(&mut self) {
        if unsafe { libc::fchdir(self.restore_fd) } < 0 {
            // Losing the cwd would misdirect every later relative access on
            // this thread.
            tracing::error!(
                error = %io::Error::last_os_error(),
                "failed to restore working directory"
            );
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_open_fd_reopens_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"content").unwrap();

        let proc_self_fd = ProcSelfFd::open().unwrap();

        // Hold the file only as O_PATH, then get a readable fd back.
        let path_c = CString::new(path.to_str().unwrap()).unwrap();
        let opath = unsafe { libc::open(path_c.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
        assert!(opath >= 0);
        let opath = unsafe { File::from_raw_fd(opath) };

        let readable = proc_self_fd
            .open_fd(opath.as_raw_fd(), libc::O_RDONLY)
            .unwrap();
        let content = std::fs::read_to_string(format!("/proc/self/fd/{}", readable.as_raw_fd()));
        assert_eq!(content.unwrap(), "content");
    }

    #[test]
    fn test_open_fd_survives_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("before");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"xyz").unwrap();

        let path_c = CString::new(path.to_str().unwrap()).unwrap();
        let opath = unsafe { libc::open(path_c.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
        assert!(opath >= 0);
        let opath = unsafe { File::from_raw_fd(opath) };

        std::fs::rename(&path, dir.path().join("after")).unwrap();

        let proc_self_fd = ProcSelfFd::open().unwrap();
        let reopened = proc_self_fd.open_fd(opath.as_raw_fd(), libc::O_RDONLY);
        assert!(reopened.is_ok());
    }
}
