//! Scheduler configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Everything one scheduler instance needs to know at startup. Loadable
/// from TOML; every field has a default so a bare `[scheduler]` table (or
/// no file at all) yields a working single-node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Unique id of this instance within the cluster. Auto-generated when
    /// empty.
    #[serde(default)]
    pub instance_id: String,
    /// Path of the shared database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Coordinate with other instances through the shared database.
    #[serde(default = "default_true")]
    pub cluster_enabled: bool,
    /// Prefix substituted into every table name, so several schedulers can
    /// share one schema.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    /// A fire time older than this at acquisition is a misfire.
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,
    /// Acquisition loop tick.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How far ahead of now acquisition may claim triggers.
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_window_ms: u64,
    /// Upper bound on triggers claimed per tick.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Bound on concurrently executing jobs on this instance.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Liveness heartbeat period.
    #[serde(default = "default_checkin_interval_ms")]
    pub checkin_interval_ms: u64,
    /// An instance is failed when silent for `checkin_interval ×
    /// checkin_grace_multiplier`.
    #[serde(default = "default_checkin_grace")]
    pub checkin_grace_multiplier: u32,
    /// Recovery sweep period.
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
    /// Bound on the wait for a cluster lock before the tick is skipped.
    #[serde(default = "default_lock_max_wait_ms")]
    pub lock_max_wait_ms: u64,
    /// Base delay between lock retries; jitter is added on top.
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("cronvault.db")
}
fn default_true() -> bool {
    true
}
fn default_table_prefix() -> String {
    "CV_".into()
}
fn default_misfire_threshold_ms() -> u64 {
    60_000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_lookahead_ms() -> u64 {
    30_000
}
fn default_max_batch_size() -> usize {
    16
}
fn default_max_workers() -> usize {
    8
}
fn default_checkin_interval_ms() -> u64 {
    7_500
}
fn default_checkin_grace() -> u32 {
    3
}
fn default_recovery_interval_ms() -> u64 {
    15_000
}
fn default_lock_max_wait_ms() -> u64 {
    5_000
}
fn default_lock_retry_ms() -> u64 {
    50
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            db_path: default_db_path(),
            cluster_enabled: default_true(),
            table_prefix: default_table_prefix(),
            misfire_threshold_ms: default_misfire_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lookahead_window_ms: default_lookahead_ms(),
            max_batch_size: default_max_batch_size(),
            max_workers: default_max_workers(),
            checkin_interval_ms: default_checkin_interval_ms(),
            checkin_grace_multiplier: default_checkin_grace(),
            recovery_interval_ms: default_recovery_interval_ms(),
            lock_max_wait_ms: default_lock_max_wait_ms(),
            lock_retry_ms: default_lock_retry_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Load config from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Fatal(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| StoreError::Fatal(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Instance id, generating a unique one when unset.
    pub fn resolved_instance_id(&self) -> String {
        if self.instance_id.is_empty() {
            format!("cv-{}", uuid::Uuid::new_v4())
        } else {
            self.instance_id.clone()
        }
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::milliseconds(self.misfire_threshold_ms as i64)
    }

    pub fn lookahead_window(&self) -> Duration {
        Duration::milliseconds(self.lookahead_window_ms as i64)
    }

    pub fn checkin_interval(&self) -> Duration {
        Duration::milliseconds(self.checkin_interval_ms as i64)
    }

    /// Staleness bound: silence longer than this marks an instance failed.
    pub fn checkin_grace(&self) -> Duration {
        self.checkin_interval() * self.checkin_grace_multiplier as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.cluster_enabled);
        assert_eq!(cfg.table_prefix, "CV_");
        assert_eq!(cfg.checkin_grace(), Duration::milliseconds(22_500));
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: SchedulerConfig = toml::from_str(
            r#"
            instance_id = "node-1"
            table_prefix = "APP_"
            max_batch_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.instance_id, "node-1");
        assert_eq!(cfg.resolved_instance_id(), "node-1");
        assert_eq!(cfg.table_prefix, "APP_");
        assert_eq!(cfg.max_batch_size, 4);
        assert_eq!(cfg.poll_interval_ms, 500);
    }

    #[test]
    fn test_generated_instance_ids_are_unique() {
        let cfg = SchedulerConfig::default();
        assert_ne!(cfg.resolved_instance_id(), cfg.resolved_instance_id());
    }
}
