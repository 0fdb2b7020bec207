//! Process-local universes implementing every collaborator trait.
//!
//! Backups snapshot a keyspace's tables and row counts; restoring one creates
//! the tables on the target. Streams confirm setup for a table once the
//! target has a matching table, unless the table is held. Failures can be
//! injected per keyspace (backups, restores) or per call count (stream
//! mutations, lost replies to a stream create).

use super::{
    universe_not_found, BackupService, OperationId, OperationState, ReplicationStreamService,
    RetryPolicy, SchemaCatalog, StreamInfo,
};
use crate::xcluster::types::{
    ConfigId, ConfigType, SchemaSnapshot, TableId, TableInfo, UniverseId,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Universe {
    tables: BTreeMap<TableId, TableInfo>,
    rows: HashMap<TableId, u64>,
}

impl Universe {
    fn snapshot(&self) -> SchemaSnapshot {
        SchemaSnapshot::new(self.tables.values().cloned())
    }
}

#[derive(Debug)]
struct Operation {
    state: OperationState,
    polls_left: u32,
}

impl Operation {
    fn new(state: OperationState, polls: u32) -> Self {
        Self {
            state,
            polls_left: polls,
        }
    }

    /// Report Running until the configured number of polls has passed.
    fn poll(&mut self) -> OperationState {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return OperationState::Running;
        }
        self.state.clone()
    }
}

#[derive(Debug)]
struct Backup {
    op: Operation,
    keyspace: String,
    tables: Vec<(TableInfo, u64)>,
}

#[derive(Debug)]
struct Restore {
    op: Operation,
    backup: OperationId,
    target: UniverseId,
    applied: bool,
}

#[derive(Debug, Default)]
struct State {
    universes: HashMap<UniverseId, Universe>,
    backups: HashMap<OperationId, Backup>,
    backup_keys: HashMap<String, OperationId>,
    restores: HashMap<OperationId, Restore>,
    restore_keys: HashMap<String, OperationId>,
    streams: HashMap<ConfigId, StreamInfo>,
    failing_keyspaces: HashSet<String>,
    failing_restores: HashSet<String>,
    stream_failures: u32,
    lost_stream_acks: u32,
    held_setup: HashSet<TableId>,
    operation_polls: u32,
    backups_started: usize,
    restores_started: usize,
    streams_created: usize,
}

impl State {
    fn universe(&self, id: UniverseId) -> Result<&Universe> {
        self.universes.get(&id).ok_or_else(|| universe_not_found(id))
    }

    fn take_stream_failure(&mut self, call: &str) -> Result<()> {
        if self.stream_failures > 0 {
            self.stream_failures -= 1;
            return Err(Error::remote("stream", format!("injected failure in {}", call)));
        }
        Ok(())
    }

    fn target_has_match(&self, stream: &StreamInfo, table_id: &str) -> bool {
        let (Some(source), Some(target)) = (
            self.universes.get(&stream.source_universe),
            self.universes.get(&stream.target_universe),
        ) else {
            return false;
        };
        if target.tables.contains_key(table_id) {
            return true;
        }
        let source = source.snapshot();
        let Some(info) = source.get(table_id) else {
            return false;
        };
        target
            .snapshot()
            .find_by_name(source.keyspace_of(info), &info.name)
            .is_some()
    }

    fn apply_restore(&mut self, restore_id: OperationId) {
        let Some(restore) = self.restores.get(&restore_id) else {
            return;
        };
        if restore.applied {
            return;
        }
        let Some(backup) = self.backups.get(&restore.backup) else {
            return;
        };
        let tables = backup.tables.clone();
        let target_id = restore.target;
        let target = self.universes.entry(target_id).or_default();
        for (info, rows) in tables {
            let existing = target
                .snapshot()
                .find_by_name(&info.keyspace, &info.name)
                .map(|t| t.id.clone());
            let id = existing.unwrap_or_else(|| info.id.clone());
            target.tables.entry(id.clone()).or_insert(TableInfo {
                id: id.clone(),
                ..info
            });
            target.rows.insert(id, rows);
        }
        if let Some(restore) = self.restores.get_mut(&restore_id) {
            restore.applied = true;
        }
        debug!(restore_id = %restore_id, target = %target_id, "Restore applied");
    }
}

/// In-memory universes plus backup and stream services over them.
#[derive(Debug, Default)]
pub struct InMemoryUniverses {
    state: Mutex<State>,
    retry: Option<RetryPolicy>,
}

impl InMemoryUniverses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `policy` for every collaborator trait instead of the default.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn add_universe(&self) -> UniverseId {
        let id = Uuid::new_v4();
        self.state.lock().universes.insert(id, Universe::default());
        id
    }

    pub fn remove_universe(&self, universe: UniverseId) -> bool {
        self.state.lock().universes.remove(&universe).is_some()
    }

    /// Create an empty table. Replaces a table with the same id.
    pub fn create_table(&self, universe: UniverseId, table: TableInfo) {
        self.create_table_with_rows(universe, table, 0);
    }

    pub fn create_table_with_rows(&self, universe: UniverseId, table: TableInfo, rows: u64) {
        let mut state = self.state.lock();
        let universe = state.universes.entry(universe).or_default();
        universe.rows.insert(table.id.clone(), rows);
        universe.tables.insert(table.id.clone(), table);
    }

    pub fn drop_table(&self, universe: UniverseId, table_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(universe) = state.universes.get_mut(&universe) else {
            return false;
        };
        universe.rows.remove(table_id);
        universe.tables.remove(table_id).is_some()
    }

    pub fn tables(&self, universe: UniverseId) -> Vec<TableInfo> {
        self.state
            .lock()
            .universes
            .get(&universe)
            .map(|u| u.tables.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Backups of `keyspace` fail from now on.
    pub fn fail_backups_for(&self, keyspace: impl Into<String>) {
        self.state.lock().failing_keyspaces.insert(keyspace.into());
    }

    pub fn clear_backup_failures(&self) {
        self.state.lock().failing_keyspaces.clear();
    }

    /// Restores of `keyspace` fail from now on; the backups still succeed.
    pub fn fail_restores_for(&self, keyspace: impl Into<String>) {
        self.state.lock().failing_restores.insert(keyspace.into());
    }

    /// The next `count` mutating stream calls fail with a retryable error.
    pub fn fail_next_stream_calls(&self, count: u32) {
        self.state.lock().stream_failures = count;
    }

    /// The next `count` stream creates take effect but report a retryable error.
    pub fn lose_next_stream_acks(&self, count: u32) {
        self.state.lock().lost_stream_acks = count;
    }

    /// Withhold setup confirmation for `table_id` until released.
    pub fn hold_setup(&self, table_id: impl Into<String>) {
        self.state.lock().held_setup.insert(table_id.into());
    }

    pub fn release_setup(&self, table_id: &str) {
        self.state.lock().held_setup.remove(table_id);
    }

    /// Number of `Running` polls a new backup or restore reports before finishing.
    pub fn set_operation_polls(&self, polls: u32) {
        self.state.lock().operation_polls = polls;
    }

    pub fn stream(&self, config_id: ConfigId) -> Option<StreamInfo> {
        self.state.lock().streams.get(&config_id).cloned()
    }

    pub fn backups_started(&self) -> usize {
        self.state.lock().backups_started
    }

    pub fn restores_started(&self) -> usize {
        self.state.lock().restores_started
    }

    pub fn streams_created(&self) -> usize {
        self.state.lock().streams_created
    }

    fn policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }
}

#[async_trait]
impl SchemaCatalog for InMemoryUniverses {
    async fn universe_exists(&self, universe: UniverseId) -> Result<bool> {
        Ok(self.state.lock().universes.contains_key(&universe))
    }

    async fn list_tables(&self, universe: UniverseId) -> Result<SchemaSnapshot> {
        Ok(self.state.lock().universe(universe)?.snapshot())
    }

    async fn has_rows(&self, universe: UniverseId, table_id: &str) -> Result<bool> {
        let state = self.state.lock();
        let universe = state.universe(universe)?;
        if !universe.tables.contains_key(table_id) {
            return Err(Error::not_found("table", table_id));
        }
        Ok(universe.rows.get(table_id).copied().unwrap_or(0) > 0)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy()
    }
}

#[async_trait]
impl BackupService for InMemoryUniverses {
    async fn find_backup(&self, key: &str) -> Result<Option<OperationId>> {
        Ok(self.state.lock().backup_keys.get(key).copied())
    }

    async fn start_backup(
        &self,
        universe: UniverseId,
        keyspace: &str,
        storage_location: &str,
        key: &str,
    ) -> Result<OperationId> {
        let mut state = self.state.lock();
        if let Some(existing) = state.backup_keys.get(key) {
            return Ok(*existing);
        }
        let source = state.universe(universe)?;
        let snapshot = source.snapshot();
        let tables: Vec<(TableInfo, u64)> = snapshot
            .iter()
            .filter(|t| snapshot.keyspace_of(t) == keyspace)
            .map(|t| (t.clone(), source.rows.get(&t.id).copied().unwrap_or(0)))
            .collect();

        let outcome = if state.failing_keyspaces.contains(keyspace) {
            OperationState::Failed(format!("backup of keyspace {} failed", keyspace))
        } else {
            OperationState::Completed
        };
        let id = Uuid::new_v4();
        let polls = state.operation_polls;
        state.backups.insert(
            id,
            Backup {
                op: Operation::new(outcome, polls),
                keyspace: keyspace.to_string(),
                tables,
            },
        );
        state.backup_keys.insert(key.to_string(), id);
        state.backups_started += 1;
        debug!(backup_id = %id, keyspace, storage_location, "Backup started");
        Ok(id)
    }

    async fn backup_state(&self, backup: OperationId) -> Result<OperationState> {
        let mut state = self.state.lock();
        let backup = state
            .backups
            .get_mut(&backup)
            .ok_or_else(|| Error::not_found("backup", backup))?;
        Ok(backup.op.poll())
    }

    async fn find_restore(&self, key: &str) -> Result<Option<OperationId>> {
        Ok(self.state.lock().restore_keys.get(key).copied())
    }

    async fn start_restore(
        &self,
        backup: OperationId,
        target: UniverseId,
        key: &str,
    ) -> Result<OperationId> {
        let mut state = self.state.lock();
        if let Some(existing) = state.restore_keys.get(key) {
            return Ok(*existing);
        }
        state.universe(target)?;
        let keyspace = state
            .backups
            .get(&backup)
            .map(|b| b.keyspace.clone())
            .ok_or_else(|| Error::not_found("backup", backup))?;
        let outcome = if state.failing_restores.contains(&keyspace) {
            OperationState::Failed(format!("restore of keyspace {} failed", keyspace))
        } else {
            OperationState::Completed
        };
        let id = Uuid::new_v4();
        let polls = state.operation_polls;
        state.restores.insert(
            id,
            Restore {
                op: Operation::new(outcome, polls),
                backup,
                target,
                applied: false,
            },
        );
        state.restore_keys.insert(key.to_string(), id);
        state.restores_started += 1;
        debug!(restore_id = %id, backup_id = %backup, "Restore started");
        Ok(id)
    }

    async fn restore_state(&self, restore: OperationId) -> Result<OperationState> {
        let mut state = self.state.lock();
        let polled = state
            .restores
            .get_mut(&restore)
            .ok_or_else(|| Error::not_found("restore", restore))?
            .op
            .poll();
        if polled == OperationState::Completed {
            state.apply_restore(restore);
        }
        Ok(polled)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy()
    }
}

#[async_trait]
impl ReplicationStreamService for InMemoryUniverses {
    async fn get_stream(&self, config_id: ConfigId) -> Result<Option<StreamInfo>> {
        Ok(self.state.lock().streams.get(&config_id).cloned())
    }

    async fn create_stream(
        &self,
        config_id: ConfigId,
        source: UniverseId,
        target: UniverseId,
        _config_type: ConfigType,
        tables: &BTreeSet<TableId>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.take_stream_failure("create_stream")?;
        if state.streams.contains_key(&config_id) {
            return Err(Error::remote(
                "stream",
                format!("stream for config {} already exists", config_id),
            ));
        }
        state.universe(source)?;
        state.universe(target)?;
        state.streams.insert(
            config_id,
            StreamInfo {
                config_id,
                source_universe: source,
                target_universe: target,
                tables: tables.clone(),
                paused: false,
            },
        );
        state.streams_created += 1;
        if state.lost_stream_acks > 0 {
            state.lost_stream_acks -= 1;
            return Err(Error::remote("stream", "reply to create_stream was lost"));
        }
        Ok(())
    }

    async fn alter_stream(
        &self,
        config_id: ConfigId,
        add: &BTreeSet<TableId>,
        remove: &BTreeSet<TableId>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.take_stream_failure("alter_stream")?;
        let stream = state
            .streams
            .get_mut(&config_id)
            .ok_or_else(|| Error::not_found("stream", config_id))?;
        stream.tables.retain(|t| !remove.contains(t));
        stream.tables.extend(add.iter().cloned());
        Ok(())
    }

    async fn set_paused(&self, config_id: ConfigId, paused: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.take_stream_failure("set_paused")?;
        let stream = state
            .streams
            .get_mut(&config_id)
            .ok_or_else(|| Error::not_found("stream", config_id))?;
        stream.paused = paused;
        Ok(())
    }

    async fn delete_stream(&self, config_id: ConfigId) -> Result<()> {
        let mut state = self.state.lock();
        state.take_stream_failure("delete_stream")?;
        state.streams.remove(&config_id);
        Ok(())
    }

    async fn setup_complete_tables(&self, config_id: ConfigId) -> Result<BTreeSet<TableId>> {
        let state = self.state.lock();
        let Some(stream) = state.streams.get(&config_id) else {
            return Ok(BTreeSet::new());
        };
        Ok(stream
            .tables
            .iter()
            .filter(|t| !state.held_setup.contains(*t) && state.target_has_match(stream, t))
            .cloned()
            .collect())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy()
    }
}

/// Retry policy suited to tests: a few fast attempts.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backup_and_restore_copy_keyspace() {
        let universes = InMemoryUniverses::new();
        let source = universes.add_universe();
        let target = universes.add_universe();
        universes.create_table_with_rows(source, TableInfo::new("t1", "db1", "orders"), 10);
        universes.create_table_with_rows(source, TableInfo::new("t2", "db2", "users"), 5);

        let backup = universes
            .start_backup(source, "db1", "s3://bucket", "task:db1")
            .await
            .unwrap();
        assert_eq!(
            universes.start_backup(source, "db1", "s3://bucket", "task:db1").await.unwrap(),
            backup
        );
        assert_eq!(universes.backups_started(), 1);
        assert_eq!(universes.backup_state(backup).await.unwrap(), OperationState::Completed);

        let restore = universes.start_restore(backup, target, "task:db1").await.unwrap();
        assert_eq!(universes.restore_state(restore).await.unwrap(), OperationState::Completed);

        let restored = universes.list_tables(target).await.unwrap();
        assert!(restored.find_by_name("db1", "orders").is_some());
        assert!(restored.find_by_name("db2", "users").is_none());
        assert!(universes.has_rows(target, "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_operations_report_running_before_finishing() {
        let universes = InMemoryUniverses::new();
        let source = universes.add_universe();
        universes.create_table(source, TableInfo::new("t1", "db1", "orders"));
        universes.set_operation_polls(2);
        universes.fail_backups_for("db1");

        let backup = universes.start_backup(source, "db1", "loc", "k").await.unwrap();
        assert_eq!(universes.backup_state(backup).await.unwrap(), OperationState::Running);
        assert_eq!(universes.backup_state(backup).await.unwrap(), OperationState::Running);
        assert!(matches!(
            universes.backup_state(backup).await.unwrap(),
            OperationState::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_setup_confirms_only_tables_present_on_target() {
        let universes = InMemoryUniverses::new();
        let source = universes.add_universe();
        let target = universes.add_universe();
        universes.create_table(source, TableInfo::new("s1", "db", "a"));
        universes.create_table(source, TableInfo::new("s2", "db", "b"));
        universes.create_table(source, TableInfo::new("s3", "db", "c"));
        // Recreated on the target under a different id.
        universes.create_table(target, TableInfo::new("t1", "db", "a"));
        universes.create_table(target, TableInfo::new("s3", "db", "c"));
        universes.hold_setup("s3");

        let config_id = Uuid::new_v4();
        let tables: BTreeSet<TableId> = ["s1", "s2", "s3"].iter().map(|s| s.to_string()).collect();
        universes
            .create_stream(config_id, source, target, ConfigType::Basic, &tables)
            .await
            .unwrap();

        let done = universes.setup_complete_tables(config_id).await.unwrap();
        assert_eq!(done.into_iter().collect::<Vec<_>>(), vec!["s1".to_string()]);

        universes.release_setup("s3");
        assert!(universes.setup_complete_tables(config_id).await.unwrap().contains("s3"));
    }

    #[tokio::test]
    async fn test_injected_stream_failures_are_retryable() {
        let universes = InMemoryUniverses::new();
        let source = universes.add_universe();
        let target = universes.add_universe();
        universes.fail_next_stream_calls(1);

        let err = universes
            .create_stream(Uuid::new_v4(), source, target, ConfigType::Basic, &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_lost_create_ack_still_creates_stream() {
        let universes = InMemoryUniverses::new();
        let source = universes.add_universe();
        let target = universes.add_universe();
        universes.lose_next_stream_acks(1);
        let config_id = Uuid::new_v4();

        let err = universes
            .create_stream(config_id, source, target, ConfigType::Basic, &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(universes.stream(config_id).is_some());
        assert_eq!(universes.streams_created(), 1);
    }
}
