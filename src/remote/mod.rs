//! Collaborator interfaces: schema catalog, backup/restore and replication streams.
//!
//! The control plane never talks to a universe directly. Everything it needs
//! from the outside world goes through these traits, each of which carries
//! the [`RetryPolicy`] its transient failures are retried under.

pub mod memory;
pub mod snapshot;

pub use memory::InMemoryUniverses;
pub use snapshot::SnapshotCatalog;

use crate::config::RetryConfig;
use crate::xcluster::types::{ConfigId, ConfigType, SchemaSnapshot, TableId, UniverseId};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

/// Identifier of a backup or restore run on the backup service.
pub type OperationId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Running,
    Completed,
    Failed(String),
}

/// A replication stream as reported by the stream subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config_id: ConfigId,
    pub source_universe: UniverseId,
    pub target_universe: UniverseId,
    pub tables: BTreeSet<TableId>,
    pub paused: bool,
}

#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn universe_exists(&self, universe: UniverseId) -> Result<bool>;

    /// Current tables of `universe`. Fails with `NotFound` if it does not exist.
    async fn list_tables(&self, universe: UniverseId) -> Result<SchemaSnapshot>;

    async fn has_rows(&self, universe: UniverseId, table_id: &str) -> Result<bool>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Keyspace-level backup and restore.
///
/// Every run is registered under a caller-chosen key so a resumed task can
/// find the run it started before a restart.
#[async_trait]
pub trait BackupService: Send + Sync {
    async fn find_backup(&self, key: &str) -> Result<Option<OperationId>>;

    async fn start_backup(
        &self,
        universe: UniverseId,
        keyspace: &str,
        storage_location: &str,
        key: &str,
    ) -> Result<OperationId>;

    async fn backup_state(&self, backup: OperationId) -> Result<OperationState>;

    async fn find_restore(&self, key: &str) -> Result<Option<OperationId>>;

    async fn start_restore(
        &self,
        backup: OperationId,
        target: UniverseId,
        key: &str,
    ) -> Result<OperationId>;

    async fn restore_state(&self, restore: OperationId) -> Result<OperationState>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// One replication stream per config, keyed by config id.
#[async_trait]
pub trait ReplicationStreamService: Send + Sync {
    async fn get_stream(&self, config_id: ConfigId) -> Result<Option<StreamInfo>>;

    async fn create_stream(
        &self,
        config_id: ConfigId,
        source: UniverseId,
        target: UniverseId,
        config_type: ConfigType,
        tables: &BTreeSet<TableId>,
    ) -> Result<()>;

    async fn alter_stream(
        &self,
        config_id: ConfigId,
        add: &BTreeSet<TableId>,
        remove: &BTreeSet<TableId>,
    ) -> Result<()>;

    async fn set_paused(&self, config_id: ConfigId, paused: bool) -> Result<()>;

    async fn delete_stream(&self, config_id: ConfigId) -> Result<()>;

    /// Tables whose replication setup the stream has confirmed.
    async fn setup_complete_tables(&self, config_id: ConfigId) -> Result<BTreeSet<TableId>>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation = what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Retrying after {:?}: {}",
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `NotFound` for a universe the catalog does not know.
pub(crate) fn universe_not_found(universe: UniverseId) -> Error {
    Error::not_found("universe", universe)
}
