//! Per-request identity switching.
//!
//! Object-creating operations run with the caller's euid/egid so new files
//! carry guest ownership. The switch uses the raw `setresuid`/`setresgid`
//! syscalls, which on Linux affect only the calling thread, so concurrent
//! handlers on other threads keep their own identity. Restoration failure
//! aborts the process: a thread stuck at reduced privilege would corrupt
//! every request scheduled onto it.
//!
//! The `CAP_FSETID` toggle used by kill-priv writes goes through libcap-ng,
//! whose state is thread local; each thread loads the process capability
//! snapshot once, under a process-wide mutex.

use std::cell::Cell;
use std::io;
use std::sync::Mutex;

use tracing::error;

fn syscall_setresgid(rgid: i64, egid: i64, sgid: i64) -> io::Result<()> {
    // Direct syscall: the glibc wrapper broadcasts the change to all
    // threads, which is exactly what must not happen here.
    let res = unsafe { libc::syscall(libc::SYS_setresgid, rgid, egid, sgid) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn syscall_setresuid(ruid: i64, euid: i64, suid: i64) -> io::Result<()> {
    let res = unsafe { libc::syscall(libc::SYS_setresuid, ruid, euid, suid) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Scoped identity switch; restores the saved euid/egid on drop.
#[derive(Debug)]
pub struct CredGuard {
    euid: libc::uid_t,
    egid: libc::gid_t,
}

/// Assume `uid`/`gid` for the calling thread.
pub fn become_caller(uid: libc::uid_t, gid: libc::gid_t) -> io::Result<CredGuard> {
    let guard = CredGuard {
        euid: unsafe { libc::geteuid() },
        egid: unsafe { libc::getegid() },
    };

    // Group first: changing the uid first could cost the privilege to
    // change the gid at all.
    syscall_setresgid(-1, i64::from(gid), -1)?;
    if let Err(e) = syscall_setresuid(-1, i64::from(uid), -1) {
        let _ = syscall_setresgid(-1, i64::from(guard.egid), -1);
        return Err(e);
    }
    Ok(guard)
}

impl Drop for CredGuard {
    fn drop(&mut self) {
        if syscall_setresuid(-1, i64::from(self.euid), -1).is_err()
            || syscall_setresgid(-1, i64::from(self.egid), -1).is_err()
        {
            error!(
                euid = self.euid,
                egid = self.egid,
                "cannot regain privileges, aborting"
            );
            std::process::abort();
        }
    }
}

// libcap-ng keeps its working set per thread; the mutex only serializes the
// initial snapshot load across threads.
static CAPS_LOAD: Mutex<()> = Mutex::new(());

thread_local! {
    static THREAD_CAPS_LOADED: Cell<bool> = const { Cell::new(false) };
}

fn cap_err(err: capng::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

fn load_thread_caps() -> io::Result<()> {
    THREAD_CAPS_LOADED.with(|loaded| {
        if loaded.get() {
            return Ok(());
        }
        let _guard = CAPS_LOAD.lock().unwrap();
        capng::get_caps_process().map_err(cap_err)?;
        loaded.set(true);
        Ok(())
    })
}

/// Scoped `CAP_FSETID` drop; regained on drop.
#[derive(Debug)]
pub struct ScopedFsetid {
    capability: u32,
}

/// Drop `CAP_FSETID` for the calling thread so the kernel clears suid/sgid
/// bits on the upcoming write. Returns `None` when the capability is not
/// held (nothing to drop, nothing to restore).
pub fn drop_fsetid() -> io::Result<Option<ScopedFsetid>> {
    load_thread_caps()?;
    let capability = capng::name_to_capability("FSETID").map_err(cap_err)?;
    if !capng::have_capability(capng::Type::EFFECTIVE, capability) {
        return Ok(None);
    }

    capng::update(vec![capng::CUpdate {
        action: capng::Action::DROP,
        cap_type: capng::Type::EFFECTIVE,
        capability,
    }])
    .map_err(cap_err)?;
    capng::apply(capng::Set::CAPS).map_err(cap_err)?;
    Ok(Some(ScopedFsetid { capability }))
}

impl Drop for ScopedFsetid {
    fn drop(&mut self) {
        let restore = capng::update(vec![capng::CUpdate {
            action: capng::Action::ADD,
            cap_type: capng::Type::EFFECTIVE,
            capability: self.capability,
        }])
        .and_then(|()| capng::apply(capng::Set::CAPS));
        if let Err(e) = restore {
            // The thread would silently stop clearing suid bits on
            // kill-priv writes.
            error!(error = %e, "cannot regain CAP_FSETID, aborting");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_become_caller_is_noop_for_own_identity() {
        // Unprivileged processes may always switch to their current ids.
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        let guard = become_caller(uid, gid).unwrap();
        assert_eq!(unsafe { libc::geteuid() }, uid);
        drop(guard);
        assert_eq!(unsafe { libc::geteuid() }, uid);
    }

    #[test]
    fn test_drop_fsetid_without_capability() {
        // Plain test runs hold no CAP_FSETID: the drop must be a no-op
        // rather than an error.
        if unsafe { libc::geteuid() } != 0 {
            let scoped = drop_fsetid().unwrap();
            assert!(scoped.is_none());
        }
    }
}
