use super::{ConfigChange, ConfigRecord, ConfigRepository, TaskStore};
use crate::task::{Task, TaskId};
use crate::xcluster::types::{ConfigId, XClusterConfig, XClusterTableConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Process-local store for configs and tasks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: RwLock<HashMap<ConfigId, ConfigRecord>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(configs: Vec<ConfigRecord>, tasks: Vec<Task>) -> Self {
        Self {
            configs: RwLock::new(configs.into_iter().map(|r| (r.config.id, r)).collect()),
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id, t)).collect()),
        }
    }

    /// Validate `change` against the current record without storing it.
    pub(crate) fn prepare_commit(&self, change: ConfigChange) -> Result<ConfigRecord> {
        let id = change.config.id;
        let configs = self.configs.read();
        let current = configs
            .get(&id)
            .ok_or_else(|| Error::not_found("config", id))?;
        current.apply(change)
    }

    pub(crate) fn prepare_insert(
        &self,
        config: XClusterConfig,
        tables: Vec<XClusterTableConfig>,
    ) -> Result<ConfigRecord> {
        if self.configs.read().contains_key(&config.id) {
            return Err(Error::Store(format!("config {} already exists", config.id)));
        }
        ConfigRecord::new_inserted(config, tables)
    }

    /// Store a prepared record if the stored version is still the one it was built from.
    pub(crate) fn install(&self, record: ConfigRecord) -> Result<ConfigRecord> {
        let mut configs = self.configs.write();
        let found = configs.get(&record.config.id).map(|r| r.config.version).unwrap_or(0);
        if found + 1 != record.config.version {
            return Err(Error::VersionConflict {
                entity: format!("config {}", record.config.id),
                expected: record.config.version - 1,
                found,
            });
        }
        configs.insert(record.config.id, record.clone());
        Ok(record)
    }

    pub(crate) fn forget(&self, id: ConfigId) -> bool {
        self.configs.write().remove(&id).is_some()
    }

    pub(crate) fn put_task(&self, task: &Task) {
        self.tasks.write().insert(task.id, task.clone());
    }
}

#[async_trait]
impl ConfigRepository for MemoryStore {
    async fn insert(
        &self,
        config: XClusterConfig,
        tables: Vec<XClusterTableConfig>,
    ) -> Result<ConfigRecord> {
        let record = self.prepare_insert(config, tables)?;
        debug!(config_id = %record.config.id, tables = record.tables.len(), "Inserted config");
        self.install(record)
    }

    async fn get(&self, id: ConfigId) -> Result<Option<ConfigRecord>> {
        Ok(self.configs.read().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<XClusterConfig>> {
        let mut configs: Vec<XClusterConfig> = self
            .configs
            .read()
            .values()
            .map(|r| r.config.clone())
            .collect();
        configs.sort_by_key(|c| c.created_at);
        Ok(configs)
    }

    async fn commit(&self, change: ConfigChange) -> Result<ConfigRecord> {
        let record = self.prepare_commit(change)?;
        self.install(record)
    }

    async fn remove(&self, id: ConfigId) -> Result<bool> {
        Ok(self.forget(id))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(Error::Store(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.put_task(task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use crate::xcluster::types::TableInfo;
    use uuid::Uuid;

    fn new_config() -> (XClusterConfig, Vec<XClusterTableConfig>) {
        let config = XClusterConfig::new(
            "repl",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Default::default(),
            ["t1".to_string()].into_iter().collect(),
        );
        let rows = vec![XClusterTableConfig::new(
            config.id,
            &TableInfo::new("t1", "db", "orders"),
            "db",
        )];
        (config, rows)
    }

    #[tokio::test]
    async fn test_concurrent_commits_one_wins() {
        let store = MemoryStore::new();
        let (config, rows) = new_config();
        let record = store.insert(config, rows).await.unwrap();

        let mut first = record.config.clone();
        first.name = "first".to_string();
        let mut second = record.config.clone();
        second.name = "second".to_string();

        store.commit(ConfigChange::config_only(first)).await.unwrap();
        let err = store
            .commit(ConfigChange::config_only(second))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));

        let stored = store.get(record.config.id).await.unwrap().unwrap();
        assert_eq!(stored.config.name, "first");
        assert_eq!(stored.config.version, 2);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let (config, rows) = new_config();
        store.insert(config.clone(), rows.clone()).await.unwrap();
        assert!(store.insert(config, rows).await.is_err());
    }

    #[tokio::test]
    async fn test_task_roundtrip_and_incomplete_listing() {
        let store = MemoryStore::new();
        let mut done = Task::from_spec(TaskSpec::new("demo").step("a"));
        let pending = Task::from_spec(TaskSpec::new("demo").step("a"));
        store.insert_task(&done).await.unwrap();
        store.insert_task(&pending).await.unwrap();
        assert!(store.insert_task(&pending).await.is_err());

        done.state = crate::task::TaskState::Success;
        store.update_task(&done).await.unwrap();

        let incomplete = store.list_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, pending.id);
    }
}
