//! Public entry point for managing replication configs.
//!
//! Mutations (create, edit, delete) validate synchronously, take the config's
//! lease and hand a pipeline to the orchestrator; the returned [`TaskHandle`]
//! tracks it. Reads never take a lease and reconcile table status against the
//! live schema on every call.

use super::lifecycle::{check_not_emptied, plan_edit, EditRequest};
use super::reconciler::{effective_status, reconcile, status_updates};
use super::steps::{changed_rows, ChangeParams};
use super::types::{
    BootstrapParams, ConfigId, ConfigSnapshot, ConfigStatus, ConfigType, SchemaSnapshot,
    TableFailure, TableId, TableStatus, TableStatusReport, UniverseId, XClusterConfig,
    XClusterTableConfig,
};
use super::{registry, Services, CHANGE_PIPELINE, CREATE_TASK, DELETE_PIPELINE, DELETE_TASK, EDIT_TASK};
use crate::remote::{with_retry, SchemaCatalog};
use crate::store::{ConfigChange, ConfigRecord, TaskStore};
use crate::task::{Lease, Orchestrator, Task, TaskHandle, TaskId, TaskSpec};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub source: UniverseId,
    pub target: UniverseId,
    pub name: String,
    pub table_ids: BTreeSet<TableId>,
    #[serde(default)]
    pub config_type: ConfigType,
    #[serde(default)]
    pub bootstrap: Option<BootstrapParams>,
}

pub struct XClusterService {
    orchestrator: Orchestrator<Services>,
}

/// What to do with a config whose task could not be started.
#[derive(Debug, Clone, Copy)]
enum Rollback {
    Remove,
    Restore(ConfigStatus),
}

impl XClusterService {
    pub fn new(services: Services, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            orchestrator: Orchestrator::new(registry(), tasks, Arc::new(services)),
        }
    }

    pub fn services(&self) -> &Services {
        self.orchestrator.services()
    }

    pub fn orchestrator(&self) -> &Orchestrator<Services> {
        &self.orchestrator
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(&self, request: CreateRequest) -> Result<TaskHandle> {
        let services = self.services();
        let name = request.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("config name must not be empty".to_string()));
        }
        if request.source == request.target {
            return Err(Error::Validation(
                "source and target universe must differ".to_string(),
            ));
        }
        if request.table_ids.is_empty() {
            return Err(Error::Validation(
                "at least one table is required".to_string(),
            ));
        }

        let existing = services.repo.list().await?;
        let same_pair = existing
            .iter()
            .filter(|c| c.source_universe == request.source && c.target_universe == request.target);
        for other in same_pair {
            if other.name == name {
                return Err(Error::Validation(format!(
                    "replication config {} already exists for this universe pair",
                    name
                )));
            }
            check_not_replicated(other, &request.table_ids)?;
        }

        for universe in [request.source, request.target] {
            if !services.universe_exists(universe).await? {
                return Err(Error::Validation(format!("universe {} does not exist", universe)));
            }
        }
        let source = services.list_tables(request.source).await?;
        let bootstrap = resolve_bootstrap(services, request.bootstrap)?;

        let config = XClusterConfig::new(
            name,
            request.source,
            request.target,
            request.config_type,
            request.table_ids.clone(),
        );
        let rows = table_rows(&config, &request.table_ids, &source)?;

        let params = ChangeParams {
            added: request.table_ids,
            bootstrap,
            ..Default::default()
        };
        let spec = pipeline(
            TaskSpec::new(CREATE_TASK)
                .for_config(config.id)
                .universes(config.universe_ids())
                .params(&params)?,
            &CHANGE_PIPELINE,
        );
        let lease = self.orchestrator.acquire_lease(&spec)?;
        let record = services.repo.insert(config, rows).await?;
        info!(
            config_id = %record.config.id,
            tables = record.tables.len(),
            "Creating replication config"
        );
        self.start_or_rollback(spec, lease, Rollback::Remove).await
    }

    #[instrument(skip(self, request))]
    pub async fn edit(&self, config_id: ConfigId, request: EditRequest) -> Result<TaskHandle> {
        check_not_emptied(&request)?;
        let services = self.services();
        let record = services.load(config_id).await?;

        let spec = TaskSpec::new(EDIT_TASK)
            .for_config(config_id)
            .universes(record.config.universe_ids());
        let lease = self.orchestrator.acquire_lease(&spec)?;

        // Re-read under the lease; the first read only told us which universes to lease.
        let record = services.load(config_id).await?;
        let config = &record.config;
        let plan = plan_edit(config, &request)?;

        if !plan.added.is_empty() {
            let source = services.list_tables(config.source_universe).await?;
            if let Some(missing) = plan.added.iter().find(|t| !source.contains(t)) {
                return Err(Error::Validation(format!(
                    "table {} does not exist on source universe {}",
                    missing, config.source_universe
                )));
            }
            for other in services.repo.list().await? {
                if other.id != config.id
                    && other.source_universe == config.source_universe
                    && other.target_universe == config.target_universe
                {
                    check_not_replicated(&other, &plan.added)?;
                }
            }
        }
        let bootstrap = resolve_bootstrap(services, request.bootstrap)?;

        let params = ChangeParams {
            added: plan.added.clone(),
            removed: plan.removed.clone(),
            bootstrap,
            status_override: plan.status_override,
            prior_status: Some(plan.prior_status),
        };
        let spec = pipeline(spec.params(&params)?, &CHANGE_PIPELINE);

        let mut updating = config.clone();
        updating.status = ConfigStatus::Updating;
        services.repo.commit(ConfigChange::config_only(updating)).await?;
        info!(
            config_id = %config_id,
            added = plan.added.len(),
            removed = plan.removed.len(),
            status_override = ?plan.status_override,
            "Editing replication config"
        );
        self.start_or_rollback(spec, lease, Rollback::Restore(plan.prior_status))
            .await
    }

    /// Start `spec`, undoing the config write that preceded it if the task
    /// was never persisted.
    async fn start_or_rollback(
        &self,
        spec: TaskSpec,
        lease: Lease,
        rollback: Rollback,
    ) -> Result<TaskHandle> {
        let config_id = spec.config_id;
        let universes = spec.universe_ids.clone();
        let err = match self.orchestrator.start(spec, lease).await {
            Ok(handle) => return Ok(handle),
            Err(e) => e,
        };
        if let Some(config_id) = config_id {
            if let Err(e) = self.rollback(config_id, &universes, rollback).await {
                warn!(config_id = %config_id, ?rollback, "Rollback after failed start failed: {}", e);
            }
        }
        Err(err)
    }

    async fn rollback(
        &self,
        config_id: ConfigId,
        universes: &[Uuid],
        rollback: Rollback,
    ) -> Result<()> {
        let services = self.services();
        let _lease = self
            .orchestrator
            .leases()
            .acquire_for_config(Uuid::new_v4(), config_id, universes)?;
        match rollback {
            Rollback::Remove => {
                services.repo.remove(config_id).await?;
            }
            Rollback::Restore(status) => {
                let mut config = services.load(config_id).await?.config;
                if config.status != status {
                    config.status = status;
                    services.repo.commit(ConfigChange::config_only(config)).await?;
                }
            }
        }
        warn!(config_id = %config_id, ?rollback, "Task did not start, config rolled back");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, config_id: ConfigId) -> Result<TaskHandle> {
        let record = self.services().load(config_id).await?;
        let spec = pipeline(
            TaskSpec::new(DELETE_TASK)
                .for_config(config_id)
                .universes(record.config.universe_ids()),
            &DELETE_PIPELINE,
        );
        info!(config_id = %config_id, "Deleting replication config");
        self.orchestrator.submit(spec).await
    }

    /// The config with every relevant table's reconciled status.
    pub async fn get(&self, config_id: ConfigId) -> Result<ConfigSnapshot> {
        let services = self.services();
        let record = services.load(config_id).await?;
        load_snapshot(services.catalog.as_ref(), &record).await
    }

    pub async fn list_by_status(
        &self,
        config_id: ConfigId,
        status: TableStatus,
    ) -> Result<Vec<TableStatusReport>> {
        let snapshot = self.get(config_id).await?;
        Ok(snapshot
            .tables
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    pub async fn list(&self) -> Result<Vec<XClusterConfig>> {
        self.services().repo.list().await
    }

    /// Persist reconciled statuses and stream setup confirmations.
    ///
    /// Writes only when no task holds the config; otherwise returns the
    /// reconciled view without persisting it.
    pub async fn sync(&self, config_id: ConfigId) -> Result<ConfigSnapshot> {
        let services = self.services();
        let record = services.load(config_id).await?;
        let lease = match self.orchestrator.leases().acquire_for_config(
            Uuid::new_v4(),
            config_id,
            &record.config.universe_ids(),
        ) {
            Ok(lease) => lease,
            Err(Error::ConcurrencyConflict { holder, .. }) => {
                debug!(config_id = %config_id, %holder, "Config busy, not persisting");
                return load_snapshot(services.catalog.as_ref(), &record).await;
            }
            Err(e) => return Err(e),
        };

        let record = services.load(config_id).await?;
        let config = &record.config;
        let source_exists = services.universe_exists(config.source_universe).await?;
        let target_exists = services.universe_exists(config.target_universe).await?;
        if !(source_exists && target_exists) {
            let record = if config.status.can_transition_to(ConfigStatus::DeletedUniverse)
                && config.status != ConfigStatus::DeletedUniverse
            {
                let mut next = config.clone();
                next.status = ConfigStatus::DeletedUniverse;
                info!(config_id = %config_id, "Universe deleted, marking config");
                services.repo.commit(ConfigChange::config_only(next)).await?
            } else {
                record
            };
            drop(lease);
            return load_snapshot(services.catalog.as_ref(), &record).await;
        }

        let source = services.list_tables(config.source_universe).await?;
        let target = services.list_tables(config.target_universe).await?;
        let streams = &services.streams;
        let confirmed = with_retry(&streams.retry_policy(), "setup_complete_tables", move || async move {
            streams.setup_complete_tables(config_id).await
        })
        .await?;

        let mut rows = record.tables.clone();
        for row in rows.values_mut() {
            if row.failure.is_none() && !row.replication_setup_done && confirmed.contains(&row.table_id) {
                row.replication_setup_done = true;
            }
        }
        let current: Vec<XClusterTableConfig> = rows.values().cloned().collect();
        let reports = reconcile(&current, &source, &target);
        for update in status_updates(&current, &reports) {
            rows.insert(update.table_id.clone(), update);
        }

        let upserts = changed_rows(&record, &rows);
        let record = if upserts.is_empty() {
            record
        } else {
            debug!(config_id = %config_id, rows = upserts.len(), "Persisting reconciled status");
            services
                .repo
                .commit(ConfigChange {
                    config: record.config.clone(),
                    upserts,
                    removals: Vec::new(),
                })
                .await?
        };
        drop(lease);
        Ok(snapshot_from(&record, &source, &target, true))
    }

    /// Pin member tables to Failed until they are removed or set up again.
    pub async fn mark_tables_failed(
        &self,
        config_id: ConfigId,
        table_ids: &BTreeSet<TableId>,
        message: &str,
    ) -> Result<ConfigSnapshot> {
        let services = self.services();
        let record = services.load(config_id).await?;
        let _lease = self.orchestrator.leases().acquire_for_config(
            Uuid::new_v4(),
            config_id,
            &record.config.universe_ids(),
        )?;

        let record = services.load(config_id).await?;
        let mut upserts = Vec::with_capacity(table_ids.len());
        for table_id in table_ids {
            let row = record.tables.get(table_id).ok_or_else(|| {
                Error::Validation(format!(
                    "table {} is not part of config {}",
                    table_id, config_id
                ))
            })?;
            let mut row = row.clone();
            row.failure = Some(TableFailure::from_operator(message));
            row.status = TableStatus::Failed;
            upserts.push(row);
        }
        let record = services
            .repo
            .commit(ConfigChange {
                config: record.config.clone(),
                upserts,
                removals: Vec::new(),
            })
            .await?;
        info!(config_id = %config_id, tables = table_ids.len(), "Marked tables failed");
        load_snapshot(services.catalog.as_ref(), &record).await
    }

    pub async fn resume_incomplete(&self) -> Result<Vec<TaskHandle>> {
        self.orchestrator.resume_incomplete().await
    }

    pub async fn abort(&self, task_id: TaskId) -> Result<()> {
        self.orchestrator.abort(task_id).await
    }

    pub async fn task(&self, task_id: TaskId) -> Result<Task> {
        self.orchestrator
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    pub async fn tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = self.orchestrator.store().list_tasks().await?;
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

/// Reconcile `record` against the live schema of both universes.
///
/// A universe that no longer exists contributes an empty snapshot, and a
/// config that depended on it reports `DeletedUniverse`.
pub async fn load_snapshot(catalog: &dyn SchemaCatalog, record: &ConfigRecord) -> Result<ConfigSnapshot> {
    let policy = catalog.retry_policy();
    let mut snapshots = Vec::with_capacity(2);
    let mut universes_present = true;
    for universe in record.config.universe_ids() {
        let exists = with_retry(&policy, "universe_exists", move || async move {
            catalog.universe_exists(universe).await
        })
        .await?;
        if exists {
            snapshots.push(
                with_retry(&policy, "list_tables", move || async move {
                    catalog.list_tables(universe).await
                })
                .await?,
            );
        } else {
            universes_present = false;
            snapshots.push(SchemaSnapshot::default());
        }
    }
    let target = snapshots.pop().unwrap_or_default();
    let source = snapshots.pop().unwrap_or_default();
    Ok(snapshot_from(record, &source, &target, universes_present))
}

fn snapshot_from(
    record: &ConfigRecord,
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
    universes_present: bool,
) -> ConfigSnapshot {
    let rows = record.rows();
    let tables = reconcile(&rows, source, target);
    let effective_status = if universes_present {
        effective_status(&record.config, &tables)
    } else if record.config.status.can_transition_to(ConfigStatus::DeletedUniverse) {
        ConfigStatus::DeletedUniverse
    } else {
        record.config.status
    };
    ConfigSnapshot {
        config: record.config.clone(),
        effective_status,
        tables,
    }
}

fn pipeline(spec: TaskSpec, steps: &[&str]) -> TaskSpec {
    steps.iter().fold(spec, |spec, step| spec.step(*step))
}

fn table_rows(
    config: &XClusterConfig,
    table_ids: &BTreeSet<TableId>,
    source: &SchemaSnapshot,
) -> Result<Vec<XClusterTableConfig>> {
    table_ids
        .iter()
        .map(|table_id| {
            let info = source.get(table_id).ok_or_else(|| {
                Error::Validation(format!(
                    "table {} does not exist on source universe {}",
                    table_id, config.source_universe
                ))
            })?;
            Ok(XClusterTableConfig::new(config.id, info, source.keyspace_of(info)))
        })
        .collect()
}

/// A table may belong to only one config per universe pair.
fn check_not_replicated(other: &XClusterConfig, table_ids: &BTreeSet<TableId>) -> Result<()> {
    match table_ids.intersection(&other.table_ids).next() {
        Some(table_id) => Err(Error::Validation(format!(
            "table {} is already replicated by config {}",
            table_id, other.name
        ))),
        None => Ok(()),
    }
}

fn resolve_bootstrap(
    services: &Services,
    bootstrap: Option<BootstrapParams>,
) -> Result<Option<BootstrapParams>> {
    let Some(mut params) = bootstrap else {
        return Ok(None);
    };
    if params.table_ids.is_empty() {
        return Ok(None);
    }
    params.storage_location = services.storage_location(Some(&params)).ok_or_else(|| {
        Error::Validation("bootstrap requires a storage location".to_string())
    })?;
    Ok(Some(params))
}
