//! Extended attribute syscall wrappers.
//!
//! Regular files and directories are re-opened through `/proc/self/fd` and
//! use the `f*xattr` family. Symlinks and special files cannot be opened,
//! so callers `fchdir` into `/proc/self/fd` and address the object by the
//! relative path of its descriptor number; these wrappers take that path.

use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;

fn check(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

pub fn fget(fd: RawFd, name: &CStr, value: &mut [u8]) -> io::Result<usize> {
    check(unsafe {
        libc::fgetxattr(
            fd,
            name.as_ptr(),
            value.as_mut_ptr().cast(),
            value.len(),
        )
    })
}

pub fn get_path(path: &CStr, name: &CStr, value: &mut [u8]) -> io::Result<usize> {
    check(unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_mut_ptr().cast(),
            value.len(),
        )
    })
}

pub fn fset(fd: RawFd, name: &CStr, value: &[u8], flags: libc::c_int) -> io::Result<()> {
    check(unsafe {
        libc::fsetxattr(fd, name.as_ptr(), value.as_ptr().cast(), value.len(), flags)
            as libc::ssize_t
    })
    .map(|_| ())
}

pub fn set_path(path: &CStr, name: &CStr, value: &[u8], flags: libc::c_int) -> io::Result<()> {
    check(unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        ) as libc::ssize_t
    })
    .map(|_| ())
}

pub fn flist(fd: RawFd, list: &mut [u8]) -> io::Result<usize> {
    check(unsafe { libc::flistxattr(fd, list.as_mut_ptr().cast(), list.len()) })
}

pub fn list_path(path: &CStr, list: &mut [u8]) -> io::Result<usize> {
    check(unsafe { libc::listxattr(path.as_ptr(), list.as_mut_ptr().cast(), list.len()) })
}

pub fn fremove(fd: RawFd, name: &CStr) -> io::Result<()> {
    check(unsafe { libc::fremovexattr(fd, name.as_ptr()) as libc::ssize_t }).map(|_| ())
}

pub fn remove_path(path: &CStr, name: &CStr) -> io::Result<()> {
    check(unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) as libc::ssize_t }).map(|_| ())
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;
    use std::os::unix::io::AsRawFd;

    use super::*;

    #[test]
    fn test_fd_xattr_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let name = CString::new("user.virtshare.test").unwrap();
        if let Err(e) = fset(file.as_raw_fd(), &name, b"value", 0) {
            // Filesystems without user xattr support cannot run this test.
            if e.raw_os_error() == Some(libc::ENOTSUP) {
                return;
            }
            panic!("fsetxattr: {e}");
        }

        let mut buf = [0u8; 64];
        let n = fget(file.as_raw_fd(), &name, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"value");

        let mut list = [0u8; 256];
        let n = flist(file.as_raw_fd(), &mut list).unwrap();
        let names: Vec<&[u8]> = list[..n].split(|&b| b == 0).filter(|s| !s.is_empty()).collect();
        assert!(names.contains(&name.as_bytes()));

        fremove(file.as_raw_fd(), &name).unwrap();
        let err = fget(file.as_raw_fd(), &name, &mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
    }

    #[test]
    fn test_size_probe_with_empty_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let name = CString::new("user.virtshare.probe").unwrap();
        if fset(file.as_raw_fd(), &name, b"12345", 0).is_err() {
            return;
        }

        let n = fget(file.as_raw_fd(), &name, &mut []).unwrap();
        assert_eq!(n, 5);
    }
}
