//! Socket and pidfile setup.
//!
//! The daemon serves exactly one vhost-user peer over a UNIX stream
//! socket. The pidfile doubles as a single-instance lock per socket path.
//! The lock is an OFD lock: it belongs to the open file description, so it
//! survives the daemonize fork (the child inherits the description) and is
//! released only when the last holder of the descriptor goes away.

use std::fs::File;
use std::io::{self, Seek as _, Write as _};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use vhost::vhost_user::Listener;

/// Where per-socket pidfiles live.
const PIDFILE_DIR: &str = "/var/run/virtshared";

/// Pidfile path for a socket: slashes in the socket path become dots.
pub fn pidfile_path(socket_path: &Path) -> PathBuf {
    let escaped: String = socket_path
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' { '.' } else { c })
        .collect();
    PathBuf::from(PIDFILE_DIR).join(format!("{escaped}.pid"))
}

/// Create and lock the pidfile. The returned file must stay open in the
/// serving process for its lifetime: the last close drops the lock. The
/// pid itself is written later, by [`write_pid`], once the process that
/// will actually serve exists.
pub fn open_pidfile(socket_path: &Path) -> io::Result<File> {
    std::fs::create_dir_all(PIDFILE_DIR)?;
    std::fs::set_permissions(PIDFILE_DIR, std::fs::Permissions::from_mode(0o700))?;
    let path = pidfile_path(socket_path);
    open_and_lock(&path)
}

fn open_and_lock(path: &Path) -> io::Result<File> {
    let path_c = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC,
            libc::c_uint::from(0o644u16),
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let file = unsafe { File::from_raw_fd(fd) };

    // A second daemon on the same socket path must fail here, not at
    // bind time after clobbering the live socket. The lock must be an OFD
    // one: a per-process record lock would vanish when the pre-daemonize
    // parent exits.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    if unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, &lock) } < 0 {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("pidfile {} is locked by another instance", path.display()),
        ));
    }

    Ok(file)
}

/// Record the serving process in the locked pidfile. Called after
/// daemonizing, so the pid is the daemon's, not the exited parent's.
pub fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.rewind()?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

/// Create the listening socket with restrictive modes, optionally handing
/// group access to `group`.
pub fn create_listener(socket_path: &Path, group: Option<&str>) -> io::Result<Listener> {
    // bind(2) cannot take a mode, so the umask stands in: group bits stay
    // only when a socket group was requested, others never.
    let old_umask = if group.is_some() {
        unsafe { libc::umask(0o007) }
    } else {
        unsafe { libc::umask(0o077) }
    };

    let listener = Listener::new(socket_path.to_string_lossy().as_ref(), true);
    unsafe { libc::umask(old_umask) };
    let listener = listener.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    if let Some(group) = group {
        let gid = resolve_group(group)?;
        let path_c = std::ffi::CString::new(socket_path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        if unsafe { libc::chown(path_c.as_ptr(), libc::uid_t::MAX, gid) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(listener)
}

/// Wrap a listening socket inherited from the invoker.
pub fn listener_from_fd(fd: RawFd) -> Listener {
    unsafe { Listener::from_raw_fd(fd) }
}

fn resolve_group(name: &str) -> io::Result<libc::gid_t> {
    let name_c = std::ffi::CString::new(name)
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let group = unsafe { libc::getgrnam(name_c.as_ptr()) };
    if group.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown group {name:?}"),
        ));
    }
    Ok(unsafe { (*group).gr_gid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidfile_path_escapes_slashes() {
        let path = pidfile_path(Path::new("/run/vm/sock"));
        assert_eq!(
            path,
            PathBuf::from("/var/run/virtshared/.run.vm.sock.pid")
        );
    }

    #[test]
    fn test_pidfile_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock.pid");

        let first = open_and_lock(&path).unwrap();

        // A second open file description on the same file must be locked
        // out even within one process; that is what makes the lock an OFD
        // lock rather than a per-process record lock.
        let err = open_and_lock(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        drop(first);
        assert!(open_and_lock(&path).is_ok());
    }

    #[test]
    fn test_write_pid_records_current_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock.pid");

        let mut file = open_and_lock(&path).unwrap();
        write_pid(&mut file).unwrap();
        // Rewriting must not accumulate stale bytes.
        write_pid(&mut file).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("{}\n", std::process::id()));
    }
}
