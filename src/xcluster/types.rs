use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

pub type ConfigId = Uuid;
pub type UniverseId = Uuid;
pub type TableId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConfigType {
    #[default]
    Basic,
    Txn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigStatus {
    Initializing,
    Running,
    Updating,
    Paused,
    Failed,
    DeletedUniverse,
}

impl ConfigStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigStatus::Initializing => "Initializing",
            ConfigStatus::Running => "Running",
            ConfigStatus::Updating => "Updating",
            ConfigStatus::Paused => "Paused",
            ConfigStatus::Failed => "Failed",
            ConfigStatus::DeletedUniverse => "DeletedUniverse",
        }
    }
}

impl fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableStatus {
    Validated,
    Bootstrapping,
    Running,
    Failed,
    ExtraTableOnSource,
    ExtraTableOnTarget,
    DroppedFromSource,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Validated => "Validated",
            TableStatus::Bootstrapping => "Bootstrapping",
            TableStatus::Running => "Running",
            TableStatus::Failed => "Failed",
            TableStatus::ExtraTableOnSource => "ExtraTableOnSource",
            TableStatus::ExtraTableOnTarget => "ExtraTableOnTarget",
            TableStatus::DroppedFromSource => "DroppedFromSource",
        }
    }

    /// Statuses a retained table may hold while its config still counts as Running.
    /// Schema drift lands here; only a recorded failure does not.
    pub fn is_accepted_while_running(&self) -> bool {
        !matches!(self, TableStatus::Failed)
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TableStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let status = match s.to_ascii_lowercase().as_str() {
            "validated" => TableStatus::Validated,
            "bootstrapping" => TableStatus::Bootstrapping,
            "running" => TableStatus::Running,
            "failed" => TableStatus::Failed,
            "extratableonsource" => TableStatus::ExtraTableOnSource,
            "extratableontarget" => TableStatus::ExtraTableOnTarget,
            "droppedfromsource" => TableStatus::DroppedFromSource,
            other => {
                return Err(crate::Error::Validation(format!(
                    "unknown table status '{}'",
                    other
                )))
            }
        };
        Ok(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureOrigin {
    /// Recorded by a failed subtask (e.g. bootstrap of the table's keyspace).
    Task,
    /// Forced by an operator.
    Operator,
}

/// A recorded failure pinning a table to `Failed` regardless of schema state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFailure {
    pub origin: FailureOrigin,
    pub message: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

impl TableFailure {
    pub fn from_task(task_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Task,
            message: message.into(),
            task_id: Some(task_id),
            recorded_at: Utc::now(),
        }
    }

    pub fn from_operator(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Operator,
            message: message.into(),
            task_id: None,
            recorded_at: Utc::now(),
        }
    }
}

/// The persisted replication config aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XClusterConfig {
    pub id: ConfigId,
    pub name: String,
    pub source_universe: UniverseId,
    pub target_universe: UniverseId,
    pub config_type: ConfigType,
    pub status: ConfigStatus,
    pub table_ids: BTreeSet<TableId>,
    /// Optimistic concurrency version, bumped by every committed write.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl XClusterConfig {
    pub fn new(
        name: impl Into<String>,
        source_universe: UniverseId,
        target_universe: UniverseId,
        config_type: ConfigType,
        table_ids: BTreeSet<TableId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source_universe,
            target_universe,
            config_type,
            status: ConfigStatus::Initializing,
            table_ids,
            version: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn universe_ids(&self) -> [UniverseId; 2] {
        [self.source_universe, self.target_universe]
    }
}

/// One row per (config, table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XClusterTableConfig {
    pub config_id: ConfigId,
    pub table_id: TableId,
    pub keyspace: String,
    pub table_name: String,
    pub status: TableStatus,
    pub replication_setup_done: bool,
    #[serde(default)]
    pub needs_bootstrap: bool,
    #[serde(default)]
    pub failure: Option<TableFailure>,
    #[serde(default)]
    pub version: u64,
}

impl XClusterTableConfig {
    pub fn new(config_id: ConfigId, table: &TableInfo, keyspace: impl Into<String>) -> Self {
        Self {
            config_id,
            table_id: table.id.clone(),
            keyspace: keyspace.into(),
            table_name: table.name.clone(),
            status: TableStatus::Validated,
            replication_setup_done: false,
            needs_bootstrap: false,
            failure: None,
            version: 0,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }
}

/// A live table as reported by a universe's schema catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub keyspace: String,
    /// Base table id when this is an index table.
    #[serde(default)]
    pub index_of: Option<TableId>,
}

impl TableInfo {
    pub fn new(id: impl Into<String>, keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            keyspace: keyspace.into(),
            index_of: None,
        }
    }

    pub fn index(
        id: impl Into<String>,
        keyspace: impl Into<String>,
        name: impl Into<String>,
        base: impl Into<String>,
    ) -> Self {
        Self {
            index_of: Some(base.into()),
            ..Self::new(id, keyspace, name)
        }
    }
}

/// Point-in-time listing of one universe's tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    tables: BTreeMap<TableId, TableInfo>,
}

impl SchemaSnapshot {
    pub fn new(tables: impl IntoIterator<Item = TableInfo>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub fn get(&self, table_id: &str) -> Option<&TableInfo> {
        self.tables.get(table_id)
    }

    pub fn contains(&self, table_id: &str) -> bool {
        self.tables.contains_key(table_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Keyspace used for scoping; index tables inherit their base table's.
    pub fn keyspace_of<'a>(&'a self, table: &'a TableInfo) -> &'a str {
        table
            .index_of
            .as_deref()
            .and_then(|base| self.tables.get(base))
            .map(|base| base.keyspace.as_str())
            .unwrap_or(table.keyspace.as_str())
    }

    pub fn find_by_name(&self, keyspace: &str, name: &str) -> Option<&TableInfo> {
        self.tables
            .values()
            .find(|t| t.name == name && self.keyspace_of(t) == keyspace)
    }
}

/// Tables that may be seeded before streaming, and where the backup goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapParams {
    pub table_ids: BTreeSet<TableId>,
    #[serde(default)]
    pub storage_location: String,
}

/// Reconciled status of a single table, member or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatusReport {
    pub table_id: TableId,
    pub keyspace: String,
    pub name: String,
    pub status: TableStatus,
    /// Whether the table is part of the config's declared membership.
    pub member: bool,
    pub source_table_id: Option<TableId>,
    pub target_table_id: Option<TableId>,
    pub replication_setup_done: bool,
    pub last_error: Option<String>,
}

/// What `get` returns: the config plus reconciled table statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub config: XClusterConfig,
    pub effective_status: ConfigStatus,
    pub tables: Vec<TableStatusReport>,
}

impl ConfigSnapshot {
    pub fn member_tables(&self) -> impl Iterator<Item = &TableStatusReport> {
        self.tables.iter().filter(|t| t.member)
    }
}
