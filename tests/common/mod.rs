#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use xcluster_ctl::config::{BootstrapConfig, OrchestratorConfig};
use xcluster_ctl::remote::memory::fast_retry;
use xcluster_ctl::remote::InMemoryUniverses;
use xcluster_ctl::store::{ConfigRepository, MemoryStore, TaskStore};
use xcluster_ctl::task::{Task, TaskId, TaskState};
use xcluster_ctl::xcluster::{
    BootstrapParams, ConfigId, ConfigSnapshot, CreateRequest, TableId, TableInfo,
    TableStatusReport, UniverseId,
};
use xcluster_ctl::{Services, XClusterService};

pub const STORAGE: &str = "s3://xcluster-backups";

/// Waits short enough that a failing test does not hang the suite.
pub fn fast_waits() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval_ms: 5,
        backup_timeout_secs: 5,
        restore_timeout_secs: 5,
        stream_setup_timeout_secs: 5,
        schema_settle_timeout_secs: 1,
    }
}

pub fn services(universes: &Arc<InMemoryUniverses>, repo: Arc<dyn ConfigRepository>) -> Services {
    Services {
        repo,
        catalog: universes.clone(),
        backups: universes.clone(),
        streams: universes.clone(),
        waits: fast_waits(),
        bootstrap: BootstrapConfig::default(),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("xcluster_ctl=debug")
        .with_test_writer()
        .try_init();
}

pub fn ids(tables: &[&str]) -> BTreeSet<TableId> {
    tables.iter().map(|t| t.to_string()).collect()
}

pub fn bootstrap(tables: &[&str]) -> Option<BootstrapParams> {
    Some(BootstrapParams {
        table_ids: ids(tables),
        storage_location: STORAGE.to_string(),
    })
}

/// Two universes with a service over them, backed by in-memory stores.
pub struct Harness {
    pub universes: Arc<InMemoryUniverses>,
    pub service: XClusterService,
    pub source: UniverseId,
    pub target: UniverseId,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let universes = Arc::new(InMemoryUniverses::new().with_retry_policy(fast_retry()));
        let source = universes.add_universe();
        let target = universes.add_universe();
        let store = Arc::new(MemoryStore::new());
        Self::assemble(universes, store.clone(), store, source, target)
    }

    pub fn assemble(
        universes: Arc<InMemoryUniverses>,
        repo: Arc<dyn ConfigRepository>,
        tasks: Arc<dyn TaskStore>,
        source: UniverseId,
        target: UniverseId,
    ) -> Self {
        let service = XClusterService::new(services(&universes, repo), tasks);
        Self {
            universes,
            service,
            source,
            target,
        }
    }

    /// An empty table on both sides. The target copy gets its own id, as
    /// it would after being created independently.
    pub fn table_on_both(&self, id: &str, keyspace: &str, name: &str) {
        self.universes
            .create_table(self.source, TableInfo::new(id, keyspace, name));
        self.universes.create_table(
            self.target,
            TableInfo::new(format!("tgt-{}", id), keyspace, name),
        );
    }

    pub fn source_table(&self, id: &str, keyspace: &str, name: &str, rows: u64) {
        self.universes
            .create_table_with_rows(self.source, TableInfo::new(id, keyspace, name), rows);
    }

    pub fn request(&self, name: &str, tables: &[&str]) -> CreateRequest {
        CreateRequest {
            source: self.source,
            target: self.target,
            name: name.to_string(),
            table_ids: ids(tables),
            config_type: Default::default(),
            bootstrap: None,
        }
    }

    /// Create a config and wait for the task to succeed.
    pub async fn create(&self, name: &str, tables: &[&str]) -> ConfigId {
        let task = self
            .service
            .create(self.request(name, tables))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Success, "create failed: {:?}", task.error);
        task.config_id.unwrap()
    }
}

pub fn report<'a>(snapshot: &'a ConfigSnapshot, name: &str) -> &'a TableStatusReport {
    snapshot
        .tables
        .iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no report for table {}", name))
}

pub fn subtask_attempts(task: &Task, step: &str) -> u32 {
    task.subtasks
        .iter()
        .find(|s| s.step == step)
        .map(|s| s.attempts)
        .unwrap_or(0)
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Wait until `step` of `task_id` is running.
pub async fn wait_for_step(service: &XClusterService, task_id: TaskId, step: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let task = service.task(task_id).await.unwrap();
        if task
            .subtasks
            .iter()
            .any(|s| s.step == step && s.state == TaskState::Running)
        {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "step {} never started", step);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
