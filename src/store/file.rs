//! Durable JSON store.
//!
//! Each config lives in `configs/<id>.json` (config plus table rows) and each
//! task in `tasks/<id>.json`. Records are loaded into memory on open; every
//! write goes to disk first and is installed in memory only once the file is
//! in place, so readers never observe state that a crash would lose.
//!
//! # Example
//!
//! ```rust,no_run
//! use xcluster_ctl::store::{ConfigRepository, FileStore};
//!
//! # async fn example() -> xcluster_ctl::Result<()> {
//! let store = FileStore::open("/var/lib/xcluster").await?;
//! for config in store.list().await? {
//!     println!("{} {}", config.id, config.status);
//! }
//! # Ok(())
//! # }
//! ```

use super::{ConfigChange, ConfigRecord, ConfigRepository, MemoryStore, TaskStore};
use crate::task::{Task, TaskId};
use crate::xcluster::types::{ConfigId, XClusterConfig, XClusterTableConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct FileStore {
    root: PathBuf,
    cache: MemoryStore,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a state directory and load every record in it.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("configs")).await?;
        fs::create_dir_all(root.join("tasks")).await?;

        let configs: Vec<ConfigRecord> = load_dir(&root.join("configs")).await?;
        let tasks: Vec<Task> = load_dir(&root.join("tasks")).await?;
        info!(
            state_dir = %root.display(),
            configs = configs.len(),
            tasks = tasks.len(),
            "Opened file store"
        );

        Ok(Self {
            root,
            cache: MemoryStore::from_parts(configs, tasks),
            write_lock: Mutex::new(()),
        })
    }

    fn config_path(&self, id: ConfigId) -> PathBuf {
        self.root.join("configs").join(format!("{}.json", id))
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id))
    }
}

#[async_trait]
impl ConfigRepository for FileStore {
    async fn insert(
        &self,
        config: XClusterConfig,
        tables: Vec<XClusterTableConfig>,
    ) -> Result<ConfigRecord> {
        let _guard = self.write_lock.lock().await;
        let record = self.cache.prepare_insert(config, tables)?;
        write_atomic(&self.config_path(record.config.id), &record).await?;
        self.cache.install(record)
    }

    async fn get(&self, id: ConfigId) -> Result<Option<ConfigRecord>> {
        self.cache.get(id).await
    }

    async fn list(&self) -> Result<Vec<XClusterConfig>> {
        self.cache.list().await
    }

    async fn commit(&self, change: ConfigChange) -> Result<ConfigRecord> {
        let _guard = self.write_lock.lock().await;
        let record = self.cache.prepare_commit(change)?;
        write_atomic(&self.config_path(record.config.id), &record).await?;
        self.cache.install(record)
    }

    async fn remove(&self, id: ConfigId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.config_path(id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
            debug!(config_id = %id, "Removed config file");
        }
        Ok(self.cache.forget(id))
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.cache.get_task(task.id).await?.is_some() {
            return Err(Error::Store(format!("task {} already exists", task.id)));
        }
        write_atomic(&self.task_path(task.id), task).await?;
        self.cache.put_task(task);
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.task_path(task.id), task).await?;
        self.cache.put_task(task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.cache.get_task(id).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.cache.list_tasks().await
    }
}

/// Write `value` as JSON so the target file is never partially written.
///
/// Writes a sibling temp file, syncs it, then renames it over the target.
async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let json = serde_json::to_string_pretty(value)?;
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn load_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {}
            Some("tmp") => {
                // Leftover from an interrupted write; the previous file is still intact.
                warn!("Discarding partial write {:?}", path);
                fs::remove_file(&path).await?;
                continue;
            }
            _ => continue,
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<T>(&content) {
            Ok(record) => records.push(record),
            Err(e) => {
                error!("Failed to parse {:?}: {}", path, e);
                return Err(Error::Store(format!("invalid record {:?}: {}", path, e)));
            }
        }
    }
    Ok(records)
}
