//! Process confinement for the file server.
//!
//! Before serving a single request the daemon moves into private mount,
//! pid and net namespaces, makes the exported directory its root via
//! `pivot_root`, installs a seccomp allowlist and trims its capability set
//! to what a file server acting as root needs. After this, a compromised
//! server can reach the exported subtree and nothing else.

use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

pub mod caps;
pub mod seccomp;

pub use caps::CapAdjustment;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to set up namespaces: {0}")]
    Namespaces(#[source] io::Error),

    #[error("failed to set up mounts: {0}")]
    Mounts(#[source] io::Error),

    #[error("failed to capture /proc/self/fd: {0}")]
    ProcSelfFd(#[source] io::Error),

    #[error("seccomp: {0}")]
    Seccomp(String),

    #[error("capabilities: {0}")]
    Capabilities(String),

    #[error("failed to raise the open file limit: {0}")]
    Rlimit(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn cerr<T: Ord + Default>(ret: T) -> io::Result<T> {
    if ret < T::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Sandbox configuration; [`Sandbox::enter`] performs the confinement.
#[derive(Debug)]
pub struct Sandbox {
    source: PathBuf,
    /// Colon-separated `+CAP`/`-CAP` adjustments from `-o modcaps=`.
    cap_adjustments: Vec<CapAdjustment>,
    /// Syslog needs two extra syscalls allowed.
    syslog: bool,
}

impl Sandbox {
    pub fn new(source: PathBuf, cap_adjustments: Vec<CapAdjustment>, syslog: bool) -> Sandbox {
        Sandbox {
            source,
            cap_adjustments,
            syslog,
        }
    }

    /// Confine the calling process. Must run before any worker thread
    /// exists (it forks). Returns the `O_PATH` dirfd of `/proc/self/fd`,
    /// captured inside the new mount namespace before the pivot makes
    /// `/proc` unreachable.
    pub fn enter(&self) -> Result<File> {
        self.enter_namespaces().map_err(Error::Namespaces)?;
        let proc_self_fd = capture_proc_self_fd().map_err(Error::ProcSelfFd)?;
        pivot_into(&self.source).map_err(Error::Mounts)?;
        seccomp::apply(self.syslog).map_err(|e| Error::Seccomp(e.to_string()))?;
        caps::apply_whitelist(&self.cap_adjustments).map_err(Error::Capabilities)?;
        info!(source = %self.source.display(), "sandbox active");
        Ok(proc_self_fd)
    }

    /// New mount, pid and net namespaces. Entering a pid namespace only
    /// affects children, so the process forks: the parent stays outside as
    /// a capability-less supervisor that forwards the child's exit status.
    fn enter_namespaces(&self) -> io::Result<()> {
        cerr(unsafe {
            libc::unshare(libc::CLONE_NEWPID | libc::CLONE_NEWNS | libc::CLONE_NEWNET)
        })?;

        let child = cerr(unsafe { libc::fork() })?;
        if child > 0 {
            // Supervisor: nothing left to do but wait, so keep no
            // capabilities while doing it.
            caps::drop_all();
            let mut status = 0;
            loop {
                let waited = unsafe { libc::waitpid(child, &mut status, 0) };
                if waited < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break;
            }
            let code = if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else {
                1
            };
            std::process::exit(code);
        }

        // Orphaned children of the old init would linger if the supervisor
        // dies silently.
        cerr(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) })?;

        // Opt out of shared mount propagation so nothing below leaks into
        // the parent namespace.
        mount(
            None,
            c"/",
            None,
            libc::MS_REC | libc::MS_SLAVE,
        )?;

        // The new pid namespace needs its own /proc for the bind below.
        mount(
            Some(c"proc"),
            c"/proc",
            Some(c"proc"),
            libc::MS_NODEV | libc::MS_NOEXEC | libc::MS_NOSUID | libc::MS_RELATIME,
        )?;

        Ok(())
    }
}

fn mount(
    source: Option<&std::ffi::CStr>,
    target: &std::ffi::CStr,
    fstype: Option<&std::ffi::CStr>,
    flags: libc::c_ulong,
) -> io::Result<()> {
    cerr(unsafe {
        libc::mount(
            source.map_or(std::ptr::null(), |s| s.as_ptr()),
            target.as_ptr(),
            fstype.map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            std::ptr::null(),
        )
    })
    .map(|_| ())
}

/// Bind `/proc/self/fd` onto a scratch directory and keep an `O_PATH` fd
/// on it. The magic-symlink indirection must be pinned now: after the
/// pivot there is no `/proc` to walk.
fn capture_proc_self_fd() -> io::Result<File> {
    let mut template = *b"/tmp/virtshared-XXXXXX\0";
    let tmpdir = unsafe { libc::mkdtemp(template.as_mut_ptr().cast()) };
    if tmpdir.is_null() {
        return Err(io::Error::last_os_error());
    }
    let tmpdir_c = unsafe { std::ffi::CStr::from_ptr(tmpdir) };

    mount(
        Some(c"/proc/self/fd"),
        tmpdir_c,
        None,
        libc::MS_BIND,
    )?;

    let fd = cerr(unsafe { libc::open(tmpdir_c.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) })?;
    let file = unsafe { File::from_raw_fd(fd) };

    cerr(unsafe { libc::umount2(tmpdir_c.as_ptr(), libc::MNT_DETACH) })?;
    if unsafe { libc::rmdir(tmpdir_c.as_ptr()) } < 0 {
        error!(error = %io::Error::last_os_error(), "failed to remove scratch directory");
    }

    Ok(file)
}

/// Make `source` the filesystem root so path resolution cannot leave it.
fn pivot_into(source: &Path) -> io::Result<()> {
    let source_c = std::ffi::CString::new(source.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

    mount(
        Some(&source_c),
        &source_c,
        None,
        libc::MS_BIND | libc::MS_REC,
    )?;

    let oldroot = cerr(unsafe {
        libc::open(
            c"/".as_ptr(),
            libc::O_DIRECTORY | libc::O_RDONLY | libc::O_CLOEXEC,
        )
    })?;
    let oldroot = unsafe { File::from_raw_fd(oldroot) };
    let newroot = cerr(unsafe {
        libc::open(
            source_c.as_ptr(),
            libc::O_DIRECTORY | libc::O_RDONLY | libc::O_CLOEXEC,
        )
    })?;
    let newroot = unsafe { File::from_raw_fd(newroot) };

    // pivot_root(".", ".") stacks the old root under the new one; it is
    // then unmounted lazily from the old root's fd.
    {
        use std::os::unix::io::AsRawFd;
        cerr(unsafe { libc::fchdir(newroot.as_raw_fd()) })?;
        cerr(unsafe { libc::syscall(libc::SYS_pivot_root, c".".as_ptr(), c".".as_ptr()) }
            as libc::c_int)?;
        cerr(unsafe { libc::fchdir(oldroot.as_raw_fd()) })?;
        mount(None, c".", None, libc::MS_SLAVE | libc::MS_REC)?;
        cerr(unsafe { libc::umount2(c".".as_ptr(), libc::MNT_DETACH) })?;
        cerr(unsafe { libc::fchdir(newroot.as_raw_fd()) })?;
    }

    Ok(())
}

/// Raise the fd limit. With no explicit value the target is
/// `min(fs.file-max - 16384, 1,000,000)`, skipped when the current limit
/// already exceeds it.
pub fn raise_nofile_limit(requested: Option<u64>) -> Result<()> {
    let target = match requested {
        Some(0) => return Ok(()),
        Some(n) => n,
        None => {
            let file_max = std::fs::read_to_string("/proc/sys/fs/file-max")
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(1_048_576);
            let headroom = file_max.saturating_sub(16_384);
            let target = headroom.min(1_000_000);

            let mut current = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut current) } == 0
                && current.rlim_cur >= target
            {
                return Ok(());
            }
            target
        }
    };

    let limit = libc::rlimit {
        rlim_cur: target,
        rlim_max: target,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } < 0 {
        let err = io::Error::last_os_error();
        // LSMs may veto the raise; that is survivable.
        if err.raw_os_error() == Some(libc::EPERM) {
            return Ok(());
        }
        return Err(Error::Rlimit(err));
    }
    Ok(())
}

/// Verify that worker threads will be able to `unshare(CLONE_FS)`. Some
/// container seccomp policies deny it, which would surface much later as
/// broken xattr handling.
pub fn validate_clone_fs() -> io::Result<()> {
    std::thread::spawn(|| cerr(unsafe { libc::unshare(libc::CLONE_FS) }).map(|_| ()))
        .join()
        .expect("probe thread panicked")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_nofile_noop_when_zero() {
        raise_nofile_limit(Some(0)).unwrap();
    }

    #[test]
    fn test_raise_nofile_default_never_lowers() {
        let mut before = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut before) };

        raise_nofile_limit(None).unwrap();

        let mut after = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut after) };
        assert!(after.rlim_cur >= before.rlim_cur.min(1_000_000));
    }

    #[test]
    fn test_validate_clone_fs() {
        // CLONE_FS is unprivileged; only exotic seccomp policies block it.
        validate_clone_fs().unwrap();
    }
}
