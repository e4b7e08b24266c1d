//! Server configuration
//!
//! Loaded from a YAML file passed to `tickstore start --config <path>`.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use tickstore_core::instance::InstanceConfig;
use tickstore_core::replication::RetryPolicy;

/// Top-level YAML configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data root directory
    pub root_directory: PathBuf,
    /// HTTP listen address (`/rpc`, `/metrics`, `/health`)
    pub listen_url: String,
    /// Optional raw framed-RPC TCP listener
    pub tcp_listen_url: Option<String>,
    /// tracing filter, e.g. `info` or `tickstore_core=debug`
    pub log_level: String,
    /// Grace period between refusing new queries and draining writes
    pub stop_grace_period_secs: u64,
    /// WAL flush/checkpoint cadence
    pub wal_rotate_interval_secs: u64,
    /// Commit straight to segment files, skipping the WAL
    pub wal_bypass: bool,
    /// Sync segments in the flusher instead of on the commit path
    pub background_sync: bool,
    pub replication: ReplicationSection,
    pub triggers: Vec<TriggerSection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("data"),
            listen_url: "127.0.0.1:5993".into(),
            tcp_listen_url: None,
            log_level: "info".into(),
            stop_grace_period_secs: 5,
            wal_rotate_interval_secs: 300,
            wal_bypass: false,
            background_sync: true,
            replication: ReplicationSection::default(),
            triggers: Vec::new(),
        }
    }
}

/// `replication:` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Serve the replication stream (primary side)
    pub enabled: bool,
    pub listen_port: u16,
    /// Non-empty makes this node a replica of the given `host:port`
    pub master_host: String,
    pub tls_enabled: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub retry_interval_secs: u64,
    pub retry_backoff_coeff: f64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_port: 5996,
            master_host: String::new(),
            tls_enabled: false,
            cert_file: PathBuf::new(),
            key_file: PathBuf::new(),
            retry_interval_secs: 10,
            retry_backoff_coeff: 2.0,
        }
    }
}

/// One `triggers:` entry: a shipped trigger module bound to a bucket pattern
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSection {
    pub module: String,
    pub on: String,
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// True when this node replays a primary instead of accepting writes
    pub fn is_replica(&self) -> bool {
        !self.replication.master_host.is_empty()
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn instance_config(&self) -> InstanceConfig {
        let mut instance = InstanceConfig::new(&self.root_directory);
        instance.wal.rotate_interval = Duration::from_secs(self.wal_rotate_interval_secs);
        instance.wal.background_sync = self.background_sync;
        // replicas never recover locally; the primary is the source of truth
        instance.wal.bypass = self.wal_bypass || self.is_replica();
        instance
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(self.replication.retry_interval_secs),
            backoff_coeff: self.replication.retry_backoff_coeff,
            ..RetryPolicy::default()
        }
    }
}
