//! Configuration surface.
//!
//! The source this store is modeled on treats tunables as process-wide
//! mutable state; here they are an explicit immutable value constructed
//! once at start-up and passed into every subsystem that needs it.

use crate::error::{KvError, KvResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Replication dispatch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Async,
    Sync,
}

impl Default for ReplicationMode {
    fn default() -> Self {
        ReplicationMode::Async
    }
}

/// Immutable, fully-resolved set of tunables for one store instance.
///
/// Built from built-in defaults, an optional TOML file, and CLI overrides,
/// in that order of increasing precedence. Cheap to clone; pass by value or
/// wrap in `Arc` when sharing across threads.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub is_follower: bool,
    pub checkpoint_interval: Duration,
    pub compaction_enabled: bool,
    pub compaction_interval: Duration,
    pub compaction_threshold: f64,
    pub compaction_min_file_size: u64,
    pub replication_enabled: bool,
    pub replication_mode: ReplicationMode,
    pub replica_addresses: Vec<SocketAddr>,
    pub replication_max_retries: u32,
    pub replication_queue_size: usize,
    pub replication_max_failures: u32,
    pub replication_timeout: Duration,
    pub metrics_log_interval: Duration,
    pub accept_poll_interval: Duration,
}

impl Config {
    /// Builds a default configuration rooted at `data_dir`.
    ///
    /// ## Example Usage
    /// ```
    /// use kv_store::config::Config;
    /// let cfg = Config::new("/tmp/example-kv-store-data-dir");
    /// assert_eq!(cfg.compaction_threshold, 0.3);
    /// ```
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            data_dir: data_dir.into(),
            is_follower: false,
            checkpoint_interval: Duration::from_secs(10),
            compaction_enabled: true,
            compaction_interval: Duration::from_secs(60),
            compaction_threshold: 0.3,
            compaction_min_file_size: 1024 * 1024,
            replication_enabled: false,
            replication_mode: ReplicationMode::Async,
            replica_addresses: Vec::new(),
            replication_max_retries: 3,
            replication_queue_size: 10_000,
            replication_max_failures: 3,
            replication_timeout: Duration::from_secs(5),
            metrics_log_interval: Duration::from_secs(30),
            accept_poll_interval: Duration::from_millis(500),
        }
    }

    /// Loads overrides from a TOML file and merges them onto `self`.
    ///
    /// Unknown keys are rejected so typos in a `kvstore.toml` are caught at
    /// start-up rather than silently ignored.
    ///
    /// ## Error Conditions
    /// - `InvalidConfig`: file exists but fails to parse.
    pub fn merge_toml_file(mut self, path: &Path) -> KvResult<Self> {
        if !path.exists() {
            return Ok(self);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| crate::error::io_err("read_config", e))?;
        let file: TomlOverrides = toml::from_str(&text).map_err(|e| KvError::InvalidConfig {
            reason: e.to_string(),
        })?;
        file.apply(&mut self)?;
        Ok(self)
    }
}

/// Mirrors [`Config`]'s tunables as optional fields so a TOML file only
/// needs to specify the keys it wants to override.
#[derive(Debug, Default, Deserialize)]
struct TomlOverrides {
    checkpoint_interval_secs: Option<u64>,
    compaction_enabled: Option<bool>,
    compaction_interval_secs: Option<u64>,
    compaction_threshold: Option<f64>,
    compaction_min_file_size: Option<u64>,
    replication_enabled: Option<bool>,
    replication_mode: Option<ReplicationMode>,
    replica_addresses: Option<Vec<String>>,
    replication_max_retries: Option<u32>,
    replication_queue_size: Option<usize>,
    replication_max_failures: Option<u32>,
    replication_timeout_secs: Option<u64>,
    metrics_log_interval_secs: Option<u64>,
    accept_poll_interval_ms: Option<u64>,
}

impl TomlOverrides {
    fn apply(self, cfg: &mut Config) -> KvResult<()> {
        if let Some(v) = self.checkpoint_interval_secs {
            cfg.checkpoint_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.compaction_enabled {
            cfg.compaction_enabled = v;
        }
        if let Some(v) = self.compaction_interval_secs {
            cfg.compaction_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.compaction_threshold {
            cfg.compaction_threshold = v;
        }
        if let Some(v) = self.compaction_min_file_size {
            cfg.compaction_min_file_size = v;
        }
        if let Some(v) = self.replication_enabled {
            cfg.replication_enabled = v;
        }
        if let Some(v) = self.replication_mode {
            cfg.replication_mode = v;
        }
        if let Some(addrs) = self.replica_addresses {
            cfg.replica_addresses = addrs
                .iter()
                .map(|a| {
                    a.parse().map_err(|_| KvError::InvalidConfig {
                        reason: format!("invalid replica address '{}'", a),
                    })
                })
                .collect::<KvResult<Vec<_>>>()?;
        }
        if let Some(v) = self.replication_max_retries {
            cfg.replication_max_retries = v;
        }
        if let Some(v) = self.replication_queue_size {
            cfg.replication_queue_size = v;
        }
        if let Some(v) = self.replication_max_failures {
            cfg.replication_max_failures = v;
        }
        if let Some(v) = self.replication_timeout_secs {
            cfg.replication_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.metrics_log_interval_secs {
            cfg.metrics_log_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.accept_poll_interval_ms {
            cfg.accept_poll_interval = Duration::from_millis(v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::new("/tmp/x");
        assert!(cfg.compaction_enabled);
        assert_eq!(cfg.compaction_threshold, 0.3);
        assert_eq!(cfg.replication_max_retries, 3);
        assert_eq!(cfg.replication_mode, ReplicationMode::Async);
    }

    #[test]
    fn missing_toml_file_is_a_noop() {
        let cfg = Config::new("/tmp/x")
            .merge_toml_file(Path::new("/tmp/does-not-exist-kvstore.toml"))
            .unwrap();
        assert_eq!(cfg.checkpoint_interval, Duration::from_secs(10));
    }

    #[test]
    fn toml_overrides_apply() {
        let dir = std::env::temp_dir().join("kvstore-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("kvstore.toml");
        std::fs::write(
            &path,
            "compaction_threshold = 0.5\ncompaction_enabled = false\n",
        )
        .unwrap();

        let cfg = Config::new(&dir).merge_toml_file(&path).unwrap();
        assert_eq!(cfg.compaction_threshold, 0.5);
        assert!(!cfg.compaction_enabled);
    }
}
