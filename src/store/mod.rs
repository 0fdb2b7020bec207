//! Persistence for replication configs and task records.
//!
//! Config writes are transactional read-modify-write: callers read a
//! [`ConfigRecord`], build a [`ConfigChange`] carrying the versions they read,
//! and [`ConfigRepository::commit`] applies it only if no row moved in the
//! meantime. Every commit re-checks that member ids and table rows agree.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::task::{Task, TaskId};
use crate::xcluster::types::{ConfigId, TableId, XClusterConfig, XClusterTableConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// Persist a new config with its table rows. Versions start at 1.
    async fn insert(
        &self,
        config: XClusterConfig,
        tables: Vec<XClusterTableConfig>,
    ) -> Result<ConfigRecord>;

    async fn get(&self, id: ConfigId) -> Result<Option<ConfigRecord>>;

    async fn list(&self) -> Result<Vec<XClusterConfig>>;

    async fn commit(&self, change: ConfigChange) -> Result<ConfigRecord>;

    /// Remove a config and all its rows. Returns false if it was already gone.
    async fn remove(&self, id: ConfigId) -> Result<bool>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<()>;

    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn list_incomplete(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

/// A config with its table rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub config: XClusterConfig,
    pub tables: BTreeMap<TableId, XClusterTableConfig>,
}

/// A versioned write against one config.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// New config value; `version` must equal the stored one.
    pub config: XClusterConfig,
    /// Rows to insert (version 0) or update (version as read).
    pub upserts: Vec<XClusterTableConfig>,
    pub removals: Vec<TableId>,
}

impl ConfigChange {
    pub fn config_only(config: XClusterConfig) -> Self {
        Self {
            config,
            upserts: Vec::new(),
            removals: Vec::new(),
        }
    }
}

impl ConfigRecord {
    pub(crate) fn new_inserted(
        mut config: XClusterConfig,
        tables: Vec<XClusterTableConfig>,
    ) -> Result<Self> {
        config.version = 1;
        let tables = tables
            .into_iter()
            .map(|mut row| {
                row.config_id = config.id;
                row.version = 1;
                (row.table_id.clone(), row)
            })
            .collect();
        let record = Self { config, tables };
        record.check_membership()?;
        Ok(record)
    }

    pub fn rows(&self) -> Vec<XClusterTableConfig> {
        self.tables.values().cloned().collect()
    }

    /// Result of applying `change`, leaving `self` untouched.
    pub(crate) fn apply(&self, change: ConfigChange) -> Result<ConfigRecord> {
        if change.config.id != self.config.id {
            return Err(Error::Store(format!(
                "change for config {} applied to {}",
                change.config.id, self.config.id
            )));
        }
        if change.config.version != self.config.version {
            return Err(Error::VersionConflict {
                entity: format!("config {}", self.config.id),
                expected: change.config.version,
                found: self.config.version,
            });
        }

        let mut next = self.clone();
        for table_id in &change.removals {
            next.tables.remove(table_id);
        }
        for mut row in change.upserts {
            let found = next.tables.get(&row.table_id).map(|r| r.version).unwrap_or(0);
            if found != row.version {
                return Err(Error::VersionConflict {
                    entity: format!("table {} of config {}", row.table_id, self.config.id),
                    expected: row.version,
                    found,
                });
            }
            row.config_id = self.config.id;
            row.version += 1;
            next.tables.insert(row.table_id.clone(), row);
        }

        next.config = change.config;
        next.config.version += 1;
        next.config.modified_at = Utc::now();
        next.check_membership()?;
        Ok(next)
    }

    fn check_membership(&self) -> Result<()> {
        if self.config.table_ids.is_empty() {
            return Err(Error::Store(format!(
                "config {} must keep at least one table",
                self.config.id
            )));
        }
        let rows = self.tables.keys();
        if rows.len() != self.config.table_ids.len()
            || !rows.zip(self.config.table_ids.iter()).all(|(a, b)| a == b)
        {
            return Err(Error::Store(format!(
                "config {} table rows do not match its member set",
                self.config.id
            )));
        }
        Ok(())
    }
}
