//! Step handlers for the create, edit and delete pipelines.
//!
//! Each handler re-reads what it needs (the config record, remote state,
//! earlier step outputs) so it can run again after a restart without
//! repeating a remote side effect or a catalog write.

use super::bootstrap::{self, present_on_target, BootstrapOutcome};
use super::reconciler::{reconcile, status_updates};
use super::types::{
    BootstrapParams, ConfigStatus, FailureOrigin, TableFailure, TableId, XClusterTableConfig,
};
use super::{Services, BOOTSTRAP, CONFIGURE_STREAM, CREATE_TASK, VALIDATE};
use crate::remote::with_retry;
use crate::store::{ConfigChange, ConfigRecord, ConfigRepository};
use crate::task::{FailureContext, StepContext, StepOutput, Task};
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Params of a create or edit task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeParams {
    pub added: BTreeSet<TableId>,
    #[serde(default)]
    pub removed: BTreeSet<TableId>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapParams>,
    #[serde(default)]
    pub status_override: Option<ConfigStatus>,
    /// Status before the edit; `None` for a create.
    #[serde(default)]
    pub prior_status: Option<ConfigStatus>,
}

impl ChangeParams {
    /// Membership once this change is applied to `current`.
    pub fn membership(&self, current: &BTreeSet<TableId>) -> BTreeSet<TableId> {
        current
            .union(&self.added)
            .filter(|t| !self.removed.contains(*t))
            .cloned()
            .collect()
    }

    pub fn final_status(&self) -> ConfigStatus {
        self.status_override.unwrap_or(ConfigStatus::Running)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Validated {
    pub needs_seed: BTreeSet<TableId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSetup {
    /// Tables the stream confirmed as set up.
    pub confirmed: BTreeSet<TableId>,
    pub paused: bool,
}

fn output<T: Serialize>(value: &T) -> Result<StepOutput> {
    Ok(Some(serde_json::to_value(value)?))
}

pub(crate) fn validate(ctx: &StepContext<Services>) -> BoxFuture<'_, Result<StepOutput>> {
    Box::pin(validate_change(ctx))
}

pub(crate) fn bootstrap(ctx: &StepContext<Services>) -> BoxFuture<'_, Result<StepOutput>> {
    Box::pin(bootstrap_tables(ctx))
}

pub(crate) fn configure_stream(ctx: &StepContext<Services>) -> BoxFuture<'_, Result<StepOutput>> {
    Box::pin(sync_stream(ctx))
}

pub(crate) fn update_catalog(ctx: &StepContext<Services>) -> BoxFuture<'_, Result<StepOutput>> {
    Box::pin(commit_membership(ctx))
}

pub(crate) fn finalize(ctx: &StepContext<Services>) -> BoxFuture<'_, Result<StepOutput>> {
    Box::pin(finalize_config(ctx))
}

pub(crate) fn delete_stream(ctx: &StepContext<Services>) -> BoxFuture<'_, Result<StepOutput>> {
    Box::pin(teardown_stream(ctx))
}

pub(crate) fn remove_config(ctx: &StepContext<Services>) -> BoxFuture<'_, Result<StepOutput>> {
    Box::pin(remove_rows(ctx))
}

pub(crate) fn mark_failed(ctx: &FailureContext<Services>) -> BoxFuture<'_, Result<()>> {
    Box::pin(record_failure(ctx.services.repo.as_ref(), &ctx.task))
}

async fn validate_change(ctx: &StepContext<Services>) -> Result<StepOutput> {
    let params: ChangeParams = ctx.params()?;
    let services = &ctx.services;
    let record = services.load(ctx.config_id()?).await?;
    let config = &record.config;

    for universe in config.universe_ids() {
        if !services.universe_exists(universe).await? {
            return Err(Error::Validation(format!("universe {} no longer exists", universe)));
        }
    }

    let source = services.list_tables(config.source_universe).await?;
    let target = services.list_tables(config.target_universe).await?;
    if let Some(missing) = params.added.iter().find(|t| !source.contains(t)) {
        return Err(Error::Validation(format!(
            "table {} does not exist on source universe {}",
            missing, config.source_universe
        )));
    }

    let needs_seed = bootstrap::tables_needing_seed(
        services,
        &record,
        &params.added,
        &params.removed,
        &source,
        &target,
    )
    .await?;

    let allowed = params.bootstrap.as_ref().map(|b| &b.table_ids);
    let unlisted: Vec<&TableId> = needs_seed
        .iter()
        .filter(|t| !allowed.map_or(false, |a| a.contains(*t)))
        .collect();
    if !unlisted.is_empty() {
        return Err(Error::Validation(format!(
            "tables {:?} need bootstrapping but are not part of the bootstrap request",
            unlisted
        )));
    }
    if !needs_seed.is_empty() && services.storage_location(params.bootstrap.as_ref()).is_none() {
        return Err(Error::Validation(
            "bootstrap requires a storage location".to_string(),
        ));
    }

    info!(
        task_id = %ctx.task_id,
        config_id = %config.id,
        added = params.added.len(),
        removed = params.removed.len(),
        needs_seed = needs_seed.len(),
        "Change validated"
    );
    output(&Validated { needs_seed })
}

async fn bootstrap_tables(ctx: &StepContext<Services>) -> Result<StepOutput> {
    let params: ChangeParams = ctx.params()?;
    let validated: Validated = ctx.output(VALIDATE)?.unwrap_or_default();
    if validated.needs_seed.is_empty() {
        return output(&BootstrapOutcome::default());
    }

    let services = &ctx.services;
    let record = services.load(ctx.config_id()?).await?;
    let config = &record.config;
    let storage = services
        .storage_location(params.bootstrap.as_ref())
        .ok_or_else(|| Error::Validation("bootstrap requires a storage location".to_string()))?;
    let source = services.list_tables(config.source_universe).await?;

    let groups = bootstrap::group_by_keyspace(&validated.needs_seed, &record, &source);
    info!(
        task_id = %ctx.task_id,
        keyspaces = groups.len(),
        tables = validated.needs_seed.len(),
        "Bootstrapping tables"
    );
    let outcome = bootstrap::seed_keyspaces(
        ctx,
        config.source_universe,
        config.target_universe,
        groups,
        &storage,
    )
    .await?;

    let membership = params.membership(&config.table_ids);
    if membership.iter().all(|t| outcome.failed_tables.contains(t)) {
        let reasons: Vec<String> = outcome
            .failed_keyspaces
            .iter()
            .map(|(keyspace, error)| format!("{}: {}", keyspace, error))
            .collect();
        return Err(Error::remote(
            "backup",
            format!("no table left to replicate; {}", reasons.join("; ")),
        ));
    }
    output(&outcome)
}

async fn sync_stream(ctx: &StepContext<Services>) -> Result<StepOutput> {
    let params: ChangeParams = ctx.params()?;
    let outcome: BootstrapOutcome = ctx.output(BOOTSTRAP)?.unwrap_or_default();
    let services = &ctx.services;
    let record = services.load(ctx.config_id()?).await?;
    let config = &record.config;
    let config_id = config.id;

    let desired: BTreeSet<TableId> = params
        .membership(&config.table_ids)
        .difference(&outcome.failed_tables)
        .cloned()
        .collect();

    let streams = &services.streams;
    let policy = streams.retry_policy();
    let existing = with_retry(&policy, "get_stream", move || async move {
        streams.get_stream(config_id).await
    })
    .await?;

    let existing = match existing {
        None => {
            let tables = &desired;
            let (source, target, config_type) =
                (config.source_universe, config.target_universe, config.config_type);
            // An attempt whose reply was lost may still have created the stream.
            with_retry(&policy, "create_stream", move || async move {
                if let Some(stream) = streams.get_stream(config_id).await? {
                    return Ok(Some(stream));
                }
                streams
                    .create_stream(config_id, source, target, config_type, tables)
                    .await?;
                Ok(None)
            })
            .await?
        }
        found => found,
    };

    let current_paused = match &existing {
        None => {
            info!(config_id = %config_id, tables = desired.len(), "Created replication stream");
            false
        }
        Some(stream) => {
            let add: BTreeSet<TableId> = desired.difference(&stream.tables).cloned().collect();
            let remove: BTreeSet<TableId> = stream.tables.difference(&desired).cloned().collect();
            if !add.is_empty() || !remove.is_empty() {
                let (add_ref, remove_ref) = (&add, &remove);
                with_retry(&policy, "alter_stream", move || async move {
                    streams.alter_stream(config_id, add_ref, remove_ref).await
                })
                .await?;
                info!(
                    config_id = %config_id,
                    added = add.len(),
                    removed = remove.len(),
                    "Altered replication stream"
                );
            }
            stream.paused
        }
    };

    let paused = params.final_status() == ConfigStatus::Paused;
    if paused != current_paused {
        with_retry(&policy, "set_paused", move || async move {
            streams.set_paused(config_id, paused).await
        })
        .await?;
        info!(config_id = %config_id, paused, "Changed stream state");
    }

    let pending: BTreeSet<TableId> = desired
        .iter()
        .filter(|t| !outcome.seeded.contains(*t))
        .filter(|t| match record.tables.get(*t) {
            None => true,
            Some(row) => match &row.failure {
                None => !row.replication_setup_done,
                Some(failure) => failure.origin == FailureOrigin::Task,
            },
        })
        .cloned()
        .collect();

    let confirmed = if pending.is_empty() || paused {
        with_retry(&policy, "setup_complete_tables", move || async move {
            streams.setup_complete_tables(config_id).await
        })
        .await?
    } else {
        let pending = &pending;
        debug!(config_id = %config_id, pending = pending.len(), "Waiting for stream setup");
        ctx.wait_until(
            "stream setup",
            services.waits.stream_setup_timeout(),
            services.waits.poll_interval(),
            move || async move {
                let done = streams.setup_complete_tables(config_id).await?;
                Ok(pending.is_subset(&done).then_some(done))
            },
        )
        .await?
    };

    output(&StreamSetup {
        confirmed: confirmed.intersection(&desired).cloned().collect(),
        paused,
    })
}

/// Fold the results of bootstrap and stream setup into one table row.
///
/// Only tables this task set up have their failure cleared. An operator
/// failure on a retained table stays until an operator-driven change
/// re-seeds or re-adds it.
fn apply_setup_result(
    row: &mut XClusterTableConfig,
    task_id: uuid::Uuid,
    params: &ChangeParams,
    outcome: &BootstrapOutcome,
    setup: &StreamSetup,
) {
    let seeded = outcome.seeded.contains(&row.table_id);
    let set_up_here = seeded
        || params.added.contains(&row.table_id)
        || row
            .failure
            .as_ref()
            .map_or(true, |f| f.origin == FailureOrigin::Task);
    if outcome.failed_tables.contains(&row.table_id) {
        row.replication_setup_done = false;
        row.needs_bootstrap = true;
        let recorded = row
            .failure
            .as_ref()
            .map_or(false, |f| f.task_id == Some(task_id));
        if !recorded {
            let reason = outcome.failure_for(&row.keyspace).unwrap_or("unknown error");
            row.failure = Some(TableFailure::from_task(
                task_id,
                format!("bootstrap of keyspace {} failed: {}", row.keyspace, reason),
            ));
        }
    } else if !set_up_here {
        debug!(table_id = %row.table_id, "Keeping operator failure on retained table");
    } else if setup.confirmed.contains(&row.table_id) {
        row.replication_setup_done = true;
        row.needs_bootstrap = false;
        row.failure = None;
    } else if seeded {
        row.replication_setup_done = false;
        row.needs_bootstrap = false;
        row.failure = None;
    }
}

/// Rows in `rows` that differ from what `record` stores.
pub(crate) fn changed_rows(
    record: &ConfigRecord,
    rows: &BTreeMap<TableId, XClusterTableConfig>,
) -> Vec<XClusterTableConfig> {
    rows.values()
        .filter(|row| record.tables.get(&row.table_id) != Some(*row))
        .cloned()
        .collect()
}

async fn commit_membership(ctx: &StepContext<Services>) -> Result<StepOutput> {
    let params: ChangeParams = ctx.params()?;
    let outcome: BootstrapOutcome = ctx.output(BOOTSTRAP)?.unwrap_or_default();
    let setup: StreamSetup = ctx.output(CONFIGURE_STREAM)?.unwrap_or_default();
    let services = &ctx.services;
    let record = services.load(ctx.config_id()?).await?;
    let config = &record.config;
    let membership = params.membership(&config.table_ids);

    let mut rows = record.tables.clone();
    rows.retain(|id, _| membership.contains(id));

    let new_ids: Vec<&TableId> = membership.iter().filter(|id| !rows.contains_key(*id)).collect();
    if !new_ids.is_empty() {
        let source = services.list_tables(config.source_universe).await?;
        for table_id in new_ids {
            let info = source.get(table_id).ok_or_else(|| {
                Error::Validation(format!(
                    "table {} was dropped from the source before it could be added",
                    table_id
                ))
            })?;
            rows.insert(
                table_id.clone(),
                XClusterTableConfig::new(config.id, info, source.keyspace_of(info)),
            );
        }
    }
    for row in rows.values_mut() {
        apply_setup_result(row, ctx.task_id, &params, &outcome, &setup);
    }

    let upserts = changed_rows(&record, &rows);
    let removals: Vec<TableId> = record
        .tables
        .keys()
        .filter(|id| !membership.contains(*id))
        .cloned()
        .collect();
    if upserts.is_empty() && removals.is_empty() && membership == config.table_ids {
        debug!(task_id = %ctx.task_id, "Catalog already up to date");
        return Ok(None);
    }

    let mut next = config.clone();
    next.table_ids = membership;
    let (upserted, removed) = (upserts.len(), removals.len());
    services
        .repo
        .commit(ConfigChange {
            config: next,
            upserts,
            removals,
        })
        .await?;
    info!(
        task_id = %ctx.task_id,
        config_id = %config.id,
        upserted,
        removed,
        "Catalog updated"
    );
    Ok(None)
}

async fn finalize_config(ctx: &StepContext<Services>) -> Result<StepOutput> {
    let params: ChangeParams = ctx.params()?;
    let services = &ctx.services;
    let record = services.load(ctx.config_id()?).await?;
    let config = &record.config;
    let config_id = config.id;
    let (source_universe, target_universe) = (config.source_universe, config.target_universe);

    // Schema changes made by the restore and the stream may land late.
    let settling: Vec<&XClusterTableConfig> =
        record.tables.values().filter(|r| r.failure.is_none()).collect();
    let settling = &settling;
    let settled = ctx
        .wait_until(
            "schema settle",
            services.waits.schema_settle_timeout(),
            services.waits.poll_interval(),
            move || async move {
                let source = services.list_tables(source_universe).await?;
                let target = services.list_tables(target_universe).await?;
                let done = settling.iter().all(|row| match source.get(&row.table_id) {
                    Some(info) => present_on_target(&source, &target, info),
                    None => true,
                });
                Ok(done.then_some((source, target)))
            },
        )
        .await;
    let (source, target) = match settled {
        Ok(snapshots) => snapshots,
        Err(Error::Timeout { message }) => {
            warn!(config_id = %config_id, "Schema did not settle: {}", message);
            (
                services.list_tables(source_universe).await?,
                services.list_tables(target_universe).await?,
            )
        }
        Err(e) => return Err(e),
    };

    let streams = &services.streams;
    let confirmed = with_retry(&streams.retry_policy(), "setup_complete_tables", move || async move {
        streams.setup_complete_tables(config_id).await
    })
    .await?;

    let mut rows = record.tables.clone();
    for row in rows.values_mut() {
        if row.failure.is_none() && confirmed.contains(&row.table_id) {
            row.replication_setup_done = true;
        }
    }
    let current: Vec<XClusterTableConfig> = rows.values().cloned().collect();
    let reports = reconcile(&current, &source, &target);
    for update in status_updates(&current, &reports) {
        rows.insert(update.table_id.clone(), update);
    }

    let upserts = changed_rows(&record, &rows);
    let status = params.final_status();
    if upserts.is_empty() && status == config.status {
        return Ok(None);
    }
    let mut next = config.clone();
    next.status = status;
    services
        .repo
        .commit(ConfigChange {
            config: next,
            upserts,
            removals: Vec::new(),
        })
        .await?;
    info!(task_id = %ctx.task_id, config_id = %config_id, %status, "Config finalized");
    Ok(None)
}

async fn teardown_stream(ctx: &StepContext<Services>) -> Result<StepOutput> {
    let services = &ctx.services;
    let config_id = ctx.config_id()?;
    let Some(record) = services.repo.get(config_id).await? else {
        return Ok(None);
    };

    if !services.universe_exists(record.config.target_universe).await? {
        warn!(
            config_id = %config_id,
            target = %record.config.target_universe,
            "Target universe is gone, skipping stream teardown"
        );
        if record.config.status != ConfigStatus::DeletedUniverse {
            let mut config = record.config.clone();
            config.status = ConfigStatus::DeletedUniverse;
            services.repo.commit(ConfigChange::config_only(config)).await?;
        }
        return output(&serde_json::json!({ "stream_deleted": false }));
    }

    let streams = &services.streams;
    let policy = streams.retry_policy();
    let existing = with_retry(&policy, "get_stream", move || async move {
        streams.get_stream(config_id).await
    })
    .await?;
    if existing.is_some() {
        with_retry(&policy, "delete_stream", move || async move {
            streams.delete_stream(config_id).await
        })
        .await?;
        info!(config_id = %config_id, "Deleted replication stream");
    }
    output(&serde_json::json!({ "stream_deleted": true }))
}

async fn remove_rows(ctx: &StepContext<Services>) -> Result<StepOutput> {
    let config_id = ctx.config_id()?;
    if ctx.services.repo.remove(config_id).await? {
        info!(task_id = %ctx.task_id, config_id = %config_id, "Config removed");
    }
    Ok(None)
}

/// Mark the config of a failed or aborted task Failed.
///
/// For a create, member tables whose setup never finished get the task's
/// error, and those the task meant to seed keep owing a seed.
/// Used as the failure hook of every task kind and by the CLI abort.
pub async fn record_failure(repo: &dyn ConfigRepository, task: &Task) -> Result<()> {
    let Some(config_id) = task.config_id else {
        return Ok(());
    };
    let Some(record) = repo.get(config_id).await? else {
        return Ok(());
    };

    let mut config = record.config.clone();
    if config.status != ConfigStatus::DeletedUniverse {
        config.status = ConfigStatus::Failed;
    }

    let mut upserts = Vec::new();
    if task.kind == CREATE_TASK {
        let message = task
            .error
            .clone()
            .unwrap_or_else(|| format!("task {} ended with {}", task.id, task.state));
        // Without a finished validation nothing proves a table can skip its seed.
        let validated = task
            .output_of(VALIDATE)
            .and_then(|v| serde_json::from_value::<Validated>(v.clone()).ok());
        for row in record.tables.values() {
            if !row.replication_setup_done && row.failure.is_none() {
                let mut row = row.clone();
                row.failure = Some(TableFailure::from_task(task.id, message.clone()));
                row.needs_bootstrap |= validated
                    .as_ref()
                    .map_or(true, |v| v.needs_seed.contains(&row.table_id));
                upserts.push(row);
            }
        }
    }

    let failed_tables = upserts.len();
    repo.commit(ConfigChange {
        config,
        upserts,
        removals: Vec::new(),
    })
    .await?;
    warn!(
        task_id = %task.id,
        config_id = %config_id,
        failed_tables,
        "Marked config failed"
    );
    Ok(())
}
