//! Peer configuration: a single immutable record threaded through every
//! component at construction time, built once from CLI flags and
//! environment overrides. There is deliberately no global/static instance —
//! every component that needs a constant receives it explicitly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// All of the tunable constants the Kademlia implementation needs, plus the
/// process-level settings (data directory, listen address).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Bucket capacity and the number of closest contacts a lookup returns.
    pub k: usize,
    /// Lookup concurrency: RPCs dispatched per round.
    pub alpha: usize,
    /// Shared-prefix threshold governing whether an unsplittable-range
    /// bucket may still be split.
    pub b_shared: usize,
    /// Bound on concurrent in-flight RPCs across one lookup.
    pub max_threads: usize,
    /// Per-RPC timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Consecutive eviction failures before a contact is replaced.
    pub eviction_limit: u32,
    #[serde(with = "humantime_serde")]
    pub bucket_refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub republish_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub originator_republish_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub expire_interval: Duration,
    pub expiration_ttl_secs: u64,

    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub verbose: String,
}

impl PeerConfig {
    /// Debug/test-friendly defaults: low alpha, short timers, so unit and
    /// integration tests don't wait on production-scale intervals.
    pub fn test_defaults() -> Self {
        PeerConfig {
            k: 20,
            alpha: 3,
            b_shared: 5,
            max_threads: 20,
            request_timeout: Duration::from_millis(500),
            eviction_limit: 5,
            bucket_refresh_interval: Duration::from_secs(3600),
            republish_interval: Duration::from_secs(3600),
            originator_republish_interval: Duration::from_secs(86_400),
            expire_interval: Duration::from_secs(3600),
            expiration_ttl_secs: 86_400,
            data_dir: PathBuf::from("./data"),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            verbose: "info".to_string(),
        }
    }

    /// Production defaults: same constants, but alpha widened to the
    /// source's non-debug fan-out.
    pub fn production_defaults() -> Self {
        let mut cfg = Self::test_defaults();
        cfg.alpha = 20;
        cfg.data_dir = resolve_data_dir("~/.kadepeer");
        cfg
    }

    /// Apply `KADEPEER_*` environment overrides on top of defaults, mirroring
    /// the override-from-env pattern used elsewhere in this codebase.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(val) = std::env::var("KADEPEER_PORT") {
            let port: u16 = val
                .parse()
                .map_err(|_| Error::Config("invalid KADEPEER_PORT".to_string()))?;
            self.listen_addr.set_port(port);
        }
        if let Ok(val) = std::env::var("KADEPEER_DATA_DIR") {
            self.data_dir = resolve_data_dir(&val);
        }
        if let Ok(val) = std::env::var("KADEPEER_ALPHA") {
            self.alpha = val
                .parse()
                .map_err(|_| Error::Config("invalid KADEPEER_ALPHA".to_string()))?;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.verbose = val;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::Config("k must be > 0".to_string()));
        }
        if self.alpha == 0 || self.alpha > self.max_threads {
            return Err(Error::Config(
                "alpha must be > 0 and <= max_threads".to_string(),
            ));
        }
        if self.eviction_limit == 0 {
            return Err(Error::Config("eviction_limit must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Expand a leading `~/` against `$HOME`, matching the resolution rule used
/// by the CLI elsewhere in this codebase.
pub fn resolve_data_dir(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_alpha_over_max_threads() {
        let mut cfg = PeerConfig::test_defaults();
        cfg.alpha = cfg.max_threads + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tilde_expands_against_home() {
        let resolved = resolve_data_dir("~/.kadepeer");
        assert!(!resolved.starts_with("~"));
    }
}
