use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use config::{Config, ConfigError, Environment, File as ConfigFile};
pub use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::address::parse_network;
use crate::ledger_writer::DEFAULT_BATCH_WIDTH;
use crate::sync::SyncOptions;
use crate::telemetry::TelemetryConfig;
use crate::utxo::RetryPolicy;
use crate::utxo_cache::DEFAULT_CAPACITY;

static GLOBAL_SETTINGS: OnceCell<Settings> = OnceCell::new();

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const ENV_PREFIX: &str = "BALANCEBLOX";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_network")]
    pub network: String,
    pub rpc: RpcSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub indexer: IndexerSettings,
    #[serde(default)]
    pub utxo_retry: RetrySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Rocksdb,
    Leveldb,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub data_dir: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Rocksdb,
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerSettings {
    pub start_height: u32,
    pub batch_width: usize,
    pub batch_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_block_retries: u32,
    pub retry_backoff_ms: u64,
    pub utxo_cache_size: usize,
    pub progress_interval: u64,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            start_height: 0,
            batch_width: DEFAULT_BATCH_WIDTH,
            batch_timeout_secs: 30,
            poll_interval_secs: 10,
            max_block_retries: 5,
            retry_backoff_ms: 2000,
            utxo_cache_size: DEFAULT_CAPACITY,
            progress_interval: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_ms: 500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
    pub rotation: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
            rotation: "daily".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// `host:port` for the `/metrics` endpoint; disabled when unset.
    pub listen: Option<String>,
}

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Message(msg.into())
}

impl Settings {
    /// Layer `path` (optional if it does not exist) under `BALANCEBLOX_*`
    /// environment variables, e.g. `BALANCEBLOX_INDEXER__BATCH_WIDTH=100`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(ConfigFile::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if parse_network(&self.network).is_none() {
            return Err(invalid(format!("unknown network '{}'", self.network)));
        }
        if self.indexer.batch_width == 0 {
            return Err(invalid("indexer.batch_width must be at least 1"));
        }
        if self.indexer.batch_timeout_secs == 0 {
            return Err(invalid("indexer.batch_timeout_secs must be greater than 0"));
        }
        if self.rpc.timeout_secs == 0 {
            return Err(invalid("rpc.timeout_secs must be greater than 0"));
        }
        if self.utxo_retry.max_attempts == 0 {
            return Err(invalid("utxo_retry.max_attempts must be at least 1"));
        }
        if let Some(listen) = &self.metrics.listen {
            listen
                .parse::<SocketAddr>()
                .map_err(|e| invalid(format!("metrics.listen '{}': {}", listen, e)))?;
        }
        Ok(())
    }

    pub fn network(&self) -> bitcoin::Network {
        parse_network(&self.network).unwrap_or(bitcoin::Network::Bitcoin)
    }

    /// Data directory with `~` and `$VARS` expanded.
    pub fn data_dir(&self) -> PathBuf {
        let expanded = shellexpand::full(&self.store.data_dir)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| self.store.data_dir.clone());
        PathBuf::from(expanded)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.indexer.batch_timeout_secs)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics.listen.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.utxo_retry.max_attempts,
            backoff: Duration::from_millis(self.utxo_retry.backoff_ms),
        }
    }

    pub fn sync_options(&self, stop_height: Option<u32>) -> SyncOptions {
        SyncOptions {
            start_height: self.indexer.start_height,
            stop_height,
            poll_interval: Duration::from_secs(self.indexer.poll_interval_secs),
            max_block_retries: self.indexer.max_block_retries,
            retry_backoff: Duration::from_millis(self.indexer.retry_backoff_ms),
            progress_interval: self.indexer.progress_interval,
        }
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        let defaults = TelemetryConfig::default();
        TelemetryConfig {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone()),
            log_format: std::env::var("BALANCEBLOX_LOG_FORMAT").unwrap_or_else(|_| self.logging.format.clone()),
            log_file: defaults.log_file.or_else(|| {
                self.logging
                    .file
                    .as_ref()
                    .map(|f| shellexpand::tilde(f).into_owned())
            }),
            rotation: self.logging.rotation.clone(),
        }
    }
}

pub fn init_global_settings(settings: Settings) -> Result<&'static Settings, ConfigError> {
    GLOBAL_SETTINGS
        .set(settings)
        .map_err(|_| invalid("Settings already initialized"))?;
    get_global_settings().ok_or_else(|| invalid("Settings not initialized"))
}

pub fn get_global_settings() -> Option<&'static Settings> {
    GLOBAL_SETTINGS.get()
}
