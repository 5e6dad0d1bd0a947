//! Seccomp allowlist.
//!
//! Built from the syscalls this server demonstrably performs: the
//! request handlers' `*at` family, the transport's epoll/eventfd set, the
//! runtime's memory and threading calls. Anything else kills the process.

use std::collections::BTreeMap;

use seccompiler::{
    apply_filter, BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported architecture {0:?}")]
    Arch(&'static str),

    #[error("failed to build seccomp filter: {0}")]
    Build(#[from] seccompiler::Error),

    #[error("failed to compile seccomp filter: {0}")]
    Compile(#[from] seccompiler::BackendError),
}

const ALLOWLIST: &[libc::c_long] = &[
    // Memory management and process basics.
    libc::SYS_brk,
    libc::SYS_mmap,
    libc::SYS_mprotect,
    libc::SYS_mremap,
    libc::SYS_munmap,
    libc::SYS_madvise,
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_getpid,
    libc::SYS_gettid,
    libc::SYS_clock_gettime,
    libc::SYS_gettimeofday,
    libc::SYS_restart_syscall,
    // Threading (worker pool, queue threads).
    libc::SYS_clone,
    libc::SYS_clone3,
    libc::SYS_futex,
    libc::SYS_set_robust_list,
    libc::SYS_rseq,
    libc::SYS_sched_getaffinity,
    libc::SYS_sigaltstack,
    libc::SYS_prctl,
    libc::SYS_unshare,
    libc::SYS_tgkill,
    libc::SYS_rt_sigaction,
    libc::SYS_rt_sigprocmask,
    libc::SYS_rt_sigreturn,
    // Rust runtime entropy (hashmap seeds).
    libc::SYS_getrandom,
    // Credential and capability switching.
    libc::SYS_capget,
    libc::SYS_capset,
    libc::SYS_setresgid,
    libc::SYS_setresuid,
    libc::SYS_getegid,
    libc::SYS_geteuid,
    // vhost-user transport: epoll loop, eventfd kicks, fd-passing socket.
    libc::SYS_epoll_create1,
    libc::SYS_epoll_ctl,
    libc::SYS_epoll_pwait,
    libc::SYS_eventfd2,
    libc::SYS_accept4,
    libc::SYS_recvmsg,
    libc::SYS_sendmsg,
    libc::SYS_ppoll,
    // Request handlers: descriptor plumbing.
    libc::SYS_openat,
    libc::SYS_close,
    libc::SYS_dup,
    libc::SYS_fcntl,
    libc::SYS_fchdir,
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_readv,
    libc::SYS_writev,
    libc::SYS_pread64,
    libc::SYS_pwrite64,
    libc::SYS_preadv,
    libc::SYS_pwritev,
    libc::SYS_lseek,
    libc::SYS_copy_file_range,
    libc::SYS_fallocate,
    libc::SYS_fsync,
    libc::SYS_fdatasync,
    libc::SYS_flock,
    libc::SYS_ftruncate,
    // Request handlers: metadata.
    libc::SYS_fstat,
    libc::SYS_newfstatat,
    libc::SYS_statx,
    libc::SYS_fstatfs,
    libc::SYS_statfs,
    libc::SYS_getdents64,
    libc::SYS_readlinkat,
    libc::SYS_mkdirat,
    libc::SYS_mknodat,
    libc::SYS_symlinkat,
    libc::SYS_linkat,
    libc::SYS_unlinkat,
    libc::SYS_renameat,
    libc::SYS_renameat2,
    libc::SYS_fchmod,
    libc::SYS_fchmodat,
    libc::SYS_fchownat,
    libc::SYS_utimensat,
    libc::SYS_umask,
    // Request handlers: extended attributes.
    libc::SYS_getxattr,
    libc::SYS_fgetxattr,
    libc::SYS_setxattr,
    libc::SYS_fsetxattr,
    libc::SYS_listxattr,
    libc::SYS_flistxattr,
    libc::SYS_removexattr,
    libc::SYS_fremovexattr,
];

/// Syscalls with no universal number across architectures; the legacy
/// variants glibc may still pick on x86_64.
#[cfg(target_arch = "x86_64")]
const ARCH_ALLOWLIST: &[libc::c_long] = &[libc::SYS_open, libc::SYS_epoll_wait, libc::SYS_time];
#[cfg(not(target_arch = "x86_64"))]
const ARCH_ALLOWLIST: &[libc::c_long] = &[];

/// `--syslog` routes log output through the libc syslog socket.
const SYSLOG_ALLOWLIST: &[libc::c_long] = &[
    libc::SYS_sendto,
    libc::SYS_socket,
    libc::SYS_connect,
    libc::SYS_getsockname,
];

fn target_arch() -> Result<TargetArch, Error> {
    TargetArch::try_from(std::env::consts::ARCH).map_err(|_| Error::Arch(std::env::consts::ARCH))
}

/// Install the allowlist; anything outside it kills the process.
pub fn apply(enable_syslog: bool) -> Result<(), Error> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for nr in ALLOWLIST.iter().chain(ARCH_ALLOWLIST) {
        rules.insert(*nr, vec![]);
    }
    if enable_syslog {
        for nr in SYSLOG_ALLOWLIST {
            rules.insert(*nr, vec![]);
        }
    }

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::KillProcess,
        SeccompAction::Allow,
        target_arch()?,
    )?;
    let program: BpfProgram = filter.try_into()?;
    apply_filter(&program)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_compiles() {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for nr in ALLOWLIST.iter().chain(SYSLOG_ALLOWLIST) {
            rules.insert(*nr, vec![]);
        }
        let filter = SeccompFilter::new(
            rules,
            SeccompAction::KillProcess,
            SeccompAction::Allow,
            target_arch().unwrap(),
        )
        .unwrap();
        let program: BpfProgram = filter.try_into().unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn test_allowlist_has_no_duplicates() {
        let mut sorted: Vec<_> = ALLOWLIST.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ALLOWLIST.len());
    }
}
