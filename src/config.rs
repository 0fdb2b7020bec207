use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub state_dir: PathBuf,
    /// Directory holding `<universe-id>.json` schema snapshots for the CLI.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_backup_timeout_secs")]
    pub backup_timeout_secs: u64,
    #[serde(default = "default_restore_timeout_secs")]
    pub restore_timeout_secs: u64,
    #[serde(default = "default_stream_setup_timeout_secs")]
    pub stream_setup_timeout_secs: u64,
    #[serde(default = "default_schema_settle_timeout_secs")]
    pub schema_settle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BootstrapConfig {
    /// Storage location used when a request carries bootstrap tables but no location.
    #[serde(default)]
    pub default_storage_location: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("XCLUSTER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    pub fn stream_setup_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_setup_timeout_secs)
    }

    pub fn schema_settle_timeout(&self) -> Duration {
        Duration::from_secs(self.schema_settle_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            backup_timeout_secs: default_backup_timeout_secs(),
            restore_timeout_secs: default_restore_timeout_secs(),
            stream_setup_timeout_secs: default_stream_setup_timeout_secs(),
            schema_settle_timeout_secs: default_schema_settle_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backup_timeout_secs() -> u64 {
    3600
}

fn default_restore_timeout_secs() -> u64 {
    3600
}

fn default_stream_setup_timeout_secs() -> u64 {
    300
}

fn default_schema_settle_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}
