//! Initial data seeding for tables joining replication.
//!
//! A table needs a seed when it is new to the config and either has rows on
//! the source or has no counterpart on the target yet, or when an earlier
//! attempt left it owing one (`needs_bootstrap`). Seeding runs per keyspace:
//! one consistent backup of the keyspace on the source, restored onto the
//! target. A keyspace whose backup or restore fails only takes its own tables
//! down with it.

use super::types::{SchemaSnapshot, TableId, TableInfo, UniverseId};
use super::Services;
use crate::remote::{with_retry, OperationId, OperationState};
use crate::store::ConfigRecord;
use crate::task::StepContext;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// What the bootstrap step did, handed to the later steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapOutcome {
    /// Tables whose keyspace was backed up and restored.
    pub seeded: BTreeSet<TableId>,
    /// Keyspace → error for every keyspace that could not be seeded.
    pub failed_keyspaces: BTreeMap<String, String>,
    /// Tables of the failed keyspaces.
    pub failed_tables: BTreeSet<TableId>,
}

impl BootstrapOutcome {
    pub fn failure_for(&self, keyspace: &str) -> Option<&str> {
        self.failed_keyspaces.get(keyspace).map(String::as_str)
    }
}

/// Whether the target has the source table `info`, by id or by keyspace and name.
pub fn present_on_target(source: &SchemaSnapshot, target: &SchemaSnapshot, info: &TableInfo) -> bool {
    target.contains(&info.id)
        || target
            .find_by_name(source.keyspace_of(info), &info.name)
            .is_some()
}

/// Tables of a pending change that must be seeded before streaming.
pub async fn tables_needing_seed(
    services: &Services,
    record: &ConfigRecord,
    added: &BTreeSet<TableId>,
    removed: &BTreeSet<TableId>,
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
) -> Result<BTreeSet<TableId>> {
    let source_universe = record.config.source_universe;
    let mut needs_seed = BTreeSet::new();

    for table_id in added {
        let Some(info) = source.get(table_id) else {
            continue;
        };
        if !present_on_target(source, target, info)
            || services.has_rows(source_universe, table_id).await?
        {
            needs_seed.insert(table_id.clone());
        }
    }

    for row in record.tables.values() {
        if removed.contains(&row.table_id) || added.contains(&row.table_id) {
            continue;
        }
        if row.needs_bootstrap && !row.replication_setup_done {
            needs_seed.insert(row.table_id.clone());
        }
    }

    Ok(needs_seed)
}

/// Group tables by the keyspace they are backed up with.
pub fn group_by_keyspace(
    tables: &BTreeSet<TableId>,
    record: &ConfigRecord,
    source: &SchemaSnapshot,
) -> BTreeMap<String, BTreeSet<TableId>> {
    let mut groups: BTreeMap<String, BTreeSet<TableId>> = BTreeMap::new();
    for table_id in tables {
        let keyspace = match (record.tables.get(table_id), source.get(table_id)) {
            (Some(row), _) => row.keyspace.clone(),
            (None, Some(info)) => source.keyspace_of(info).to_string(),
            (None, None) => continue,
        };
        groups.entry(keyspace).or_default().insert(table_id.clone());
    }
    groups
}

/// Seed every keyspace in `groups`, isolating failures per keyspace.
///
/// Only an abort stops the loop early.
pub async fn seed_keyspaces(
    ctx: &StepContext<Services>,
    source: UniverseId,
    target: UniverseId,
    groups: BTreeMap<String, BTreeSet<TableId>>,
    storage_location: &str,
) -> Result<BootstrapOutcome> {
    let mut outcome = BootstrapOutcome::default();
    for (keyspace, tables) in groups {
        match seed_keyspace(ctx, source, target, &keyspace, storage_location).await {
            Ok(()) => outcome.seeded.extend(tables),
            Err(Error::Aborted) => return Err(Error::Aborted),
            Err(e) => {
                warn!(
                    task_id = %ctx.task_id,
                    keyspace = %keyspace,
                    tables = tables.len(),
                    "Bootstrap failed: {}",
                    e
                );
                outcome.failed_keyspaces.insert(keyspace, e.to_string());
                outcome.failed_tables.extend(tables);
            }
        }
    }
    Ok(outcome)
}

/// Idempotency key for this task's backup and restore of `keyspace`.
pub fn operation_key(ctx: &StepContext<Services>, keyspace: &str) -> String {
    format!("{}:{}", ctx.task_id, keyspace)
}

#[instrument(skip(ctx, source, target, storage_location), fields(task_id = %ctx.task_id))]
async fn seed_keyspace(
    ctx: &StepContext<Services>,
    source: UniverseId,
    target: UniverseId,
    keyspace: &str,
    storage_location: &str,
) -> Result<()> {
    let services = &ctx.services;
    let backups = &services.backups;
    let policy = backups.retry_policy();
    let key = operation_key(ctx, keyspace);
    let key = key.as_str();

    let backup = match with_retry(&policy, "find_backup", move || async move {
        backups.find_backup(key).await
    })
    .await?
    {
        Some(existing) => {
            info!(backup_id = %existing, "Reusing backup");
            existing
        }
        None => {
            with_retry(&policy, "start_backup", move || async move {
                backups
                    .start_backup(source, keyspace, storage_location, key)
                    .await
            })
            .await?
        }
    };
    wait_for_operation(ctx, Phase::Backup, backup, services.waits.backup_timeout()).await?;

    let restore = match with_retry(&policy, "find_restore", move || async move {
        backups.find_restore(key).await
    })
    .await?
    {
        Some(existing) => {
            info!(restore_id = %existing, "Reusing restore");
            existing
        }
        None => {
            with_retry(&policy, "start_restore", move || async move {
                backups.start_restore(backup, target, key).await
            })
            .await?
        }
    };
    wait_for_operation(ctx, Phase::Restore, restore, services.waits.restore_timeout()).await?;

    info!("Keyspace seeded");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Backup,
    Restore,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Backup => "backup",
            Phase::Restore => "restore",
        }
    }
}

async fn wait_for_operation(
    ctx: &StepContext<Services>,
    phase: Phase,
    id: OperationId,
    timeout: Duration,
) -> Result<()> {
    let backups = &ctx.services.backups;
    let poll = ctx.services.waits.poll_interval();
    let what = phase.label();
    ctx.wait_until(what, timeout, poll, move || async move {
        let state = match phase {
            Phase::Backup => backups.backup_state(id).await?,
            Phase::Restore => backups.restore_state(id).await?,
        };
        match state {
            OperationState::Running => Ok(None),
            OperationState::Completed => Ok(Some(())),
            OperationState::Failed(message) => Err(Error::remote(what, message)),
        }
    })
    .await
}
