//! Read-only schema catalog backed by JSON snapshot files.
//!
//! Each universe is described by `<dir>/<universe-id>.json`:
//!
//! ```json
//! {
//!   "tables": [
//!     { "id": "000033e1", "keyspace": "db1", "name": "orders", "has_rows": true },
//!     { "id": "000033e2", "keyspace": "db1", "name": "orders_idx", "index_of": "000033e1" }
//!   ]
//! }
//! ```
//!
//! Used by the CLI to reconcile persisted configs without a live universe.

use super::{universe_not_found, RetryPolicy, SchemaCatalog};
use crate::config::Config;
use crate::xcluster::types::{SchemaSnapshot, TableInfo, UniverseId};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    tables: Vec<SnapshotTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotTable {
    #[serde(flatten)]
    info: TableInfo,
    #[serde(default)]
    has_rows: bool,
}

pub struct SnapshotCatalog {
    dir: PathBuf,
    retry: RetryPolicy,
}

impl SnapshotCatalog {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            retry: RetryPolicy::default(),
        }
    }

    /// Catalog over `store.snapshot_dir`, retrying per the `retry` section.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .store
            .snapshot_dir
            .as_ref()
            .map(|dir| Self::new(dir).with_retry_policy(RetryPolicy::from(&config.retry)))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    fn path(&self, universe: UniverseId) -> PathBuf {
        self.dir.join(format!("{}.json", universe))
    }

    async fn load(&self, universe: UniverseId) -> Result<SnapshotFile> {
        let path = self.path(universe);
        if !fs::try_exists(&path).await? {
            return Err(universe_not_found(universe));
        }
        let content = fs::read_to_string(&path).await?;
        let file: SnapshotFile = serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("invalid snapshot {:?}: {}", path, e)))?;
        debug!(universe = %universe, tables = file.tables.len(), "Loaded schema snapshot");
        Ok(file)
    }
}

#[async_trait]
impl SchemaCatalog for SnapshotCatalog {
    async fn universe_exists(&self, universe: UniverseId) -> Result<bool> {
        Ok(fs::try_exists(self.path(universe)).await?)
    }

    async fn list_tables(&self, universe: UniverseId) -> Result<SchemaSnapshot> {
        let file = self.load(universe).await?;
        Ok(SchemaSnapshot::new(file.tables.into_iter().map(|t| t.info)))
    }

    async fn has_rows(&self, universe: UniverseId, table_id: &str) -> Result<bool> {
        let file = self.load(universe).await?;
        file.tables
            .iter()
            .find(|t| t.info.id == table_id)
            .map(|t| t.has_rows)
            .ok_or_else(|| Error::not_found("table", table_id))
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}
