//! Passthrough filesystem: exports a host directory tree over the FUSE
//! protocol by operating on `*at` syscalls and `/proc/self/fd`.
//!
//! The server is a stateless passthrough: no file data is cached here, and
//! every request maps to at most a handful of host syscalls against
//! long-lived `O_PATH` descriptors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub mod cred;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod locks;
pub mod procfs;
pub mod xattr;

pub use filesystem::PassthroughFs;
pub use procfs::ProcSelfFd;

/// How aggressively the guest may cache entries and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// The guest re-asks for everything.
    None,
    /// Short-lived caching, suitable when the host may change the tree.
    #[default]
    Auto,
    /// The guest caches for a day; the export is effectively exclusive.
    Always,
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CachePolicy::None),
            "auto" => Ok(CachePolicy::Auto),
            "always" => Ok(CachePolicy::Always),
            other => Err(format!("unknown cache policy {other:?}")),
        }
    }
}

/// Filesystem behavior switches, fed from the daemon's `-o` options.
#[derive(Debug, Clone)]
pub struct Config {
    /// The exported directory.
    pub source: PathBuf,
    pub cache: CachePolicy,
    /// Entry/attribute timeout override; derived from `cache` when unset.
    pub timeout: Option<Duration>,
    pub writeback: bool,
    pub posix_lock: bool,
    pub flock: bool,
    pub xattr: bool,
    /// Explicit readdirplus toggle; `None` enables it unless `cache=none`.
    pub readdirplus: Option<bool>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            source: PathBuf::from("/"),
            cache: CachePolicy::default(),
            timeout: None,
            writeback: false,
            posix_lock: true,
            flock: false,
            xattr: false,
            readdirplus: None,
        }
    }
}

impl Config {
    /// The entry/attribute timeout handed to the guest.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(match self.cache {
            CachePolicy::None => Duration::ZERO,
            CachePolicy::Auto => Duration::from_secs(1),
            CachePolicy::Always => Duration::from_secs(86400),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_policy_parse() {
        assert_eq!("none".parse::<CachePolicy>().unwrap(), CachePolicy::None);
        assert_eq!("auto".parse::<CachePolicy>().unwrap(), CachePolicy::Auto);
        assert_eq!(
            "always".parse::<CachePolicy>().unwrap(),
            CachePolicy::Always
        );
        assert!("sometimes".parse::<CachePolicy>().is_err());
    }

    #[test]
    fn test_timeout_follows_cache_policy() {
        let mut config = Config::default();
        assert_eq!(config.effective_timeout(), Duration::from_secs(1));

        config.cache = CachePolicy::None;
        assert_eq!(config.effective_timeout(), Duration::ZERO);

        config.cache = CachePolicy::Always;
        assert_eq!(config.effective_timeout(), Duration::from_secs(86400));

        config.timeout = Some(Duration::from_secs(7));
        assert_eq!(config.effective_timeout(), Duration::from_secs(7));
    }
}
