//! Ingestion configuration.
//!
//! [`IngestConfig`] starts from defaults, then applies an optional config
//! file and `KINSHIP_*` environment variables. Command-line flags are
//! applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use kinship_cluster::ChangeMode;
use kinship_core::constants::{
    Network, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_FETCH_TIMEOUT_SECS,
    DEFAULT_MAX_CONCURRENT_LOOKUPS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS,
};

/// Configuration for an ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Ledger network.
    pub network: Network,
    /// Root directory for persistent data.
    pub data_dir: PathBuf,
    /// JSON-RPC endpoint of the ledger node.
    pub rpc_url: String,
    /// RPC user for HTTP basic auth.
    pub rpc_user: Option<String>,
    /// RPC password for HTTP basic auth.
    pub rpc_password: Option<String>,
    /// First height to replay. Defaults to the stored resume height.
    pub start_height: Option<u64>,
    /// Last height to replay, inclusive. Defaults to the tip at start.
    pub end_height: Option<u64>,
    /// Per-lookup timeout in seconds.
    pub fetch_timeout_secs: u64,
    /// Retries for a transient lookup failure.
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds.
    pub retry_backoff_ms: u64,
    /// Concurrent previous-output lookups per transaction.
    pub max_concurrent_lookups: usize,
    /// Blocks between persisted checkpoints; 0 disables checkpoints.
    pub checkpoint_interval: u64,
    /// Unspent outputs kept in memory to avoid lookups.
    pub output_cache_limit: usize,
    /// Change heuristic.
    pub change_heuristic: ChangeMode,
    /// Log level filter string (e.g. "info", "kinship_ingest=debug").
    pub log_level: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let network = Network::default();
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kinship");

        Self {
            network,
            data_dir,
            rpc_url: format!("http://127.0.0.1:{}", network.default_rpc_port()),
            rpc_user: None,
            rpc_password: None,
            start_height: None,
            end_height: None,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_concurrent_lookups: DEFAULT_MAX_CONCURRENT_LOOKUPS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            output_cache_limit: 1_000_000,
            change_heuristic: ChangeMode::default(),
            log_level: "info".to_string(),
        }
    }
}

impl IngestConfig {
    /// Load defaults, then `path` if given, then `KINSHIP_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let cfg: Self = builder
            .add_source(Environment::with_prefix("KINSHIP").try_parsing(true))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that would stall a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_lookups == 0 {
            return Err(ConfigError::Message(
                "max_concurrent_lookups must be at least 1".into(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "fetch_timeout_secs must be at least 1".into(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_height, self.end_height) {
            if start > end {
                return Err(ConfigError::Message(format!(
                    "start_height {start} is after end_height {end}"
                )));
            }
        }
        Ok(())
    }

    /// Path to the RocksDB cluster database, separated per network.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir
            .join(self.network.data_dir_suffix())
            .join("clusters")
    }

    /// Per-lookup timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Base retry backoff.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
