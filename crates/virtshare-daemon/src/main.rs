//! virtshared: vhost-user filesystem daemon.
//!
//! Exports a host directory tree to a guest as a virtio-fs device. A
//! hypervisor connects to the UNIX socket, negotiates vhost-user and
//! drives the FUSE request virtqueues; the daemon answers from inside a
//! namespace sandbox pivoted into the exported tree.

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vhost::vhost_user::Error as VhostUserError;
use vhost_user_backend::{Error as DaemonError, VhostUserDaemon};
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};

use virtshare_fuse::Server;
use virtshare_passthrough::{CachePolicy, Config, PassthroughFs, ProcSelfFd};
use virtshare_sandbox::caps::parse_modcaps;
use virtshare_sandbox::{raise_nofile_limit, validate_clone_fs, CapAdjustment, Sandbox};

mod backend;
mod syslog;
mod transport;

use backend::FsBackend;

#[derive(Debug, Parser)]
#[command(name = "virtshared", version, about = "vhost-user filesystem daemon")]
struct Cli {
    /// Listen on this UNIX socket path
    #[arg(long, conflicts_with = "fd")]
    socket_path: Option<PathBuf>,

    /// Use an inherited listening socket fd instead of a path
    #[arg(long)]
    fd: Option<RawFd>,

    /// Name of the group granted access to the socket (requires --socket-path)
    #[arg(long, requires = "socket_path")]
    socket_group: Option<String>,

    /// Worker threads for the request queue; 0 processes requests serially
    /// on the queue thread
    #[arg(long, default_value_t = 0)]
    thread_pool_size: usize,

    /// Mount-style options, comma separated (source=PATH, cache=MODE, ...)
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// Raise the open file limit to this value (default: derived from
    /// fs.file-max)
    #[arg(long)]
    rlimit_nofile: Option<u64>,

    /// Log to syslog instead of stderr
    #[arg(long)]
    syslog: bool,

    /// Log at debug level
    #[arg(short = 'd', long)]
    debug: bool,

    /// Detach from the terminal
    #[arg(short = 'f', long)]
    daemonize: bool,

    /// Print the vhost-user backend capabilities as JSON and exit
    #[arg(long)]
    print_capabilities: bool,
}

/// Accumulated `-o` options.
#[derive(Debug)]
struct MountOptions {
    source: PathBuf,
    cache: CachePolicy,
    timeout: Option<Duration>,
    writeback: bool,
    posix_lock: bool,
    flock: bool,
    xattr: bool,
    readdirplus: Option<bool>,
    modcaps: Vec<CapAdjustment>,
    log_level: Option<String>,
}

impl Default for MountOptions {
    fn default() -> MountOptions {
        MountOptions {
            source: PathBuf::from("/"),
            cache: CachePolicy::default(),
            timeout: None,
            writeback: false,
            posix_lock: true,
            flock: false,
            xattr: false,
            readdirplus: None,
            modcaps: Vec::new(),
            log_level: None,
        }
    }
}

impl MountOptions {
    fn parse(specs: &[String]) -> Result<MountOptions, String> {
        let mut opts = MountOptions::default();
        for spec in specs {
            for part in spec.split(',').filter(|p| !p.is_empty()) {
                opts.apply(part)?;
            }
        }
        Ok(opts)
    }

    fn apply(&mut self, part: &str) -> Result<(), String> {
        match part.split_once('=') {
            Some(("source", value)) => self.source = PathBuf::from(value),
            Some(("cache", value)) => self.cache = value.parse()?,
            Some(("timeout", value)) => {
                let secs: f64 = value
                    .parse()
                    .map_err(|_| format!("invalid timeout {value:?}"))?;
                if secs < 0.0 {
                    return Err(format!("timeout is negative ({secs})"));
                }
                self.timeout = Some(Duration::from_secs_f64(secs));
            }
            Some(("modcaps", value)) => self.modcaps = parse_modcaps(value)?,
            Some(("log_level", value)) => {
                match value {
                    "trace" | "debug" | "info" | "warn" | "err" => {}
                    other => return Err(format!("unknown log level {other:?}")),
                }
                self.log_level = Some(value.to_string());
            }
            Some((key, _)) => return Err(format!("unknown option {key:?}")),
            None => match part {
                "writeback" => self.writeback = true,
                "no_writeback" => self.writeback = false,
                "flock" => self.flock = true,
                "no_flock" => self.flock = false,
                "posix_lock" => self.posix_lock = true,
                "no_posix_lock" => self.posix_lock = false,
                "xattr" => self.xattr = true,
                "no_xattr" => self.xattr = false,
                "readdirplus" => self.readdirplus = Some(true),
                "no_readdirplus" => self.readdirplus = Some(false),
                other => return Err(format!("unknown option {other:?}")),
            },
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct Capabilities {
    #[serde(rename = "type")]
    device_type: &'static str,
}

fn init_logging(cli: &Cli, log_level: Option<&str>) {
    let level = if cli.debug {
        "debug"
    } else {
        match log_level {
            Some("err") => "error",
            Some(level) => level,
            None => "info",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if cli.syslog {
        syslog::open(c"virtshared");
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(syslog::SyslogMakeWriter)
            .with_ansi(false)
            .without_time()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}

static SIGNAL_EXIT_FDS: OnceLock<Vec<RawFd>> = OnceLock::new();
static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_exit_signal(_signum: libc::c_int) {
    // Only async-signal-safe calls here: flag the exit and kick the queue
    // threads' kill eventfds.
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
    if let Some(fds) = SIGNAL_EXIT_FDS.get() {
        let value: u64 = 1;
        for &fd in fds {
            unsafe {
                libc::write(fd, std::ptr::addr_of!(value).cast(), 8);
            }
        }
    }
}

fn install_signal_handlers(exit_fds: Vec<RawFd>) -> io::Result<()> {
    SIGNAL_EXIT_FDS.set(exit_fds).ok();

    // A disconnecting peer must surface as an error return, not a fatal
    // signal.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_exit_signal as usize;
    for signum in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        if unsafe { libc::sigaction(signum, &action, std::ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Classic double-fork detach. The intermediate parent waits on a pipe so
/// startup failures after the fork still reach the invoker's exit status.
fn daemonize() -> io::Result<()> {
    let mut pipe = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid > 0 {
        let mut status = 1u8;
        unsafe {
            libc::close(pipe[1]);
            libc::read(pipe[0], std::ptr::addr_of_mut!(status).cast(), 1);
        }
        std::process::exit(i32::from(status));
    }

    unsafe { libc::close(pipe[0]) };
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    let null = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
    if null >= 0 {
        unsafe {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            libc::dup2(null, 2);
            if null > 2 {
                libc::close(null);
            }
        }
    }

    let ok = 0u8;
    unsafe {
        libc::write(pipe[1], std::ptr::addr_of!(ok).cast(), 1);
        libc::close(pipe[1]);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_capabilities {
        let caps = Capabilities { device_type: "fs" };
        println!("{}", serde_json::to_string_pretty(&caps)?);
        return Ok(());
    }

    let opts = MountOptions::parse(&cli.options).map_err(|e| anyhow::anyhow!(e))?;
    init_logging(&cli, opts.log_level.as_deref());

    // The guest kernel already applied the caller's umask to creation
    // modes; a server-side one would mask twice.
    unsafe { libc::umask(0) };

    let source = opts
        .source
        .canonicalize()
        .with_context(|| format!("failed to resolve source {:?}", opts.source))?;
    if !source.is_dir() {
        bail!("source {:?} is not a directory", source);
    }

    validate_clone_fs().context(
        "unshare(CLONE_FS) is not permitted; the seccomp/container policy must allow it",
    )?;

    // The pidfile lock has to precede the socket so a second instance
    // cannot clobber a live socket. It is an OFD lock, so it stays held
    // through the daemonize fork below.
    let (listener, mut pidfile) = match (&cli.socket_path, cli.fd) {
        (Some(path), None) => {
            let pidfile = transport::open_pidfile(path).context("failed to lock pidfile")?;
            let listener = transport::create_listener(path, cli.socket_group.as_deref())
                .context("failed to create vhost-user socket")?;
            (listener, Some(pidfile))
        }
        (None, Some(fd)) => (transport::listener_from_fd(fd), None),
        _ => bail!("exactly one of --socket-path and --fd is required"),
    };

    if cli.daemonize {
        daemonize().context("failed to daemonize")?;
    }

    // Only now does the serving process exist; its pid is the one worth
    // recording. The file stays open (and locked) until exit.
    if let Some(pidfile) = pidfile.as_mut() {
        transport::write_pid(pidfile).context("failed to write pidfile")?;
    }

    raise_nofile_limit(cli.rlimit_nofile).context("failed to raise the fd limit")?;

    // Confinement: after this the export is "/" and /proc is gone except
    // for the captured dirfd.
    let sandbox = Sandbox::new(source, opts.modcaps.clone(), cli.syslog);
    let proc_self_fd = sandbox.enter().context("failed to enter sandbox")?;

    let config = Config {
        source: PathBuf::from("/"),
        cache: opts.cache,
        timeout: opts.timeout,
        writeback: opts.writeback,
        posix_lock: opts.posix_lock,
        flock: opts.flock,
        xattr: opts.xattr,
        readdirplus: opts.readdirplus,
    };
    let fs = PassthroughFs::with_proc_self_fd(config, ProcSelfFd::from_file(proc_self_fd))
        .context("failed to open the exported tree")?;

    let server = Arc::new(Server::new(fs));
    let fs_backend = Arc::new(
        FsBackend::new(Arc::clone(&server), cli.thread_pool_size)
            .context("failed to create backend")?,
    );

    install_signal_handlers(fs_backend.exit_event_fds())
        .context("failed to install signal handlers")?;

    let mut daemon = VhostUserDaemon::new(
        "virtshared".to_string(),
        Arc::clone(&fs_backend),
        GuestMemoryAtomic::new(GuestMemoryMmap::new()),
    )
    .map_err(|e| anyhow::anyhow!("failed to create vhost-user daemon: {e}"))?;

    info!(
        thread_pool_size = cli.thread_pool_size,
        "waiting for vhost-user peer"
    );
    daemon
        .start(listener)
        .map_err(|e| anyhow::anyhow!("failed to start vhost-user daemon: {e}"))?;

    match daemon.wait() {
        Ok(()) => info!("session ended"),
        Err(DaemonError::HandleRequest(VhostUserError::PartialMessage)) => {
            info!("vhost-user peer disconnected");
        }
        Err(e) if EXIT_REQUESTED.load(Ordering::SeqCst) => {
            info!(error = %e, "shutting down on signal");
        }
        Err(e) => error!(error = %e, "vhost-user session failed"),
    }

    // Queue threads are gone; drop whatever lookups the guest still owed.
    fs_backend.request_exit();
    server.destroy();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_options_defaults() {
        let opts = MountOptions::parse(&[]).unwrap();
        assert_eq!(opts.source, PathBuf::from("/"));
        assert_eq!(opts.cache, CachePolicy::Auto);
        assert!(opts.posix_lock);
        assert!(!opts.writeback);
        assert!(!opts.xattr);
        assert!(opts.readdirplus.is_none());
    }

    #[test]
    fn test_mount_options_parse_combined() {
        let opts = MountOptions::parse(&[
            "source=/srv/export,cache=always,writeback".to_string(),
            "no_posix_lock,flock,xattr,timeout=2.5".to_string(),
        ])
        .unwrap();
        assert_eq!(opts.source, PathBuf::from("/srv/export"));
        assert_eq!(opts.cache, CachePolicy::Always);
        assert!(opts.writeback);
        assert!(!opts.posix_lock);
        assert!(opts.flock);
        assert!(opts.xattr);
        assert_eq!(opts.timeout, Some(Duration::from_secs_f64(2.5)));
    }

    #[test]
    fn test_mount_options_modcaps_and_log_level() {
        let opts =
            MountOptions::parse(&["modcaps=+sys_admin:-mknod,log_level=debug".to_string()])
                .unwrap();
        assert_eq!(opts.modcaps.len(), 2);
        assert!(opts.modcaps[0].add);
        assert_eq!(opts.modcaps[0].name, "SYS_ADMIN");
        assert_eq!(opts.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_mount_options_rejects_unknown() {
        assert!(MountOptions::parse(&["frobnicate".to_string()]).is_err());
        assert!(MountOptions::parse(&["cache=sometimes".to_string()]).is_err());
        assert!(MountOptions::parse(&["timeout=-1".to_string()]).is_err());
        assert!(MountOptions::parse(&["log_level=loud".to_string()]).is_err());
    }

    #[test]
    fn test_readdirplus_toggle() {
        let opts = MountOptions::parse(&["readdirplus".to_string()]).unwrap();
        assert_eq!(opts.readdirplus, Some(true));
        let opts = MountOptions::parse(&["no_readdirplus".to_string()]).unwrap();
        assert_eq!(opts.readdirplus, Some(false));
    }

    #[test]
    fn test_capabilities_json() {
        let caps = Capabilities { device_type: "fs" };
        assert_eq!(
            serde_json::to_string(&caps).unwrap(),
            r#"{"type":"fs"}"#
        );
    }
}
