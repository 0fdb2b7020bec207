//! xCluster replication configs: data model, reconciliation, lifecycle rules,
//! the create/edit/delete pipelines and the public service.

pub mod bootstrap;
pub mod lifecycle;
pub mod reconciler;
pub mod service;
pub mod steps;
pub mod types;

pub use lifecycle::{EditPlan, EditRequest};
pub use service::{load_snapshot, CreateRequest, XClusterService};
pub use types::*;

use crate::config::{BootstrapConfig, OrchestratorConfig};
use crate::remote::{with_retry, BackupService, ReplicationStreamService, SchemaCatalog};
use crate::store::{ConfigRecord, ConfigRepository};
use crate::task::StepRegistry;
use crate::{Error, Result};
use std::sync::Arc;

pub const CREATE_TASK: &str = "xcluster.create";
pub const EDIT_TASK: &str = "xcluster.edit";
pub const DELETE_TASK: &str = "xcluster.delete";

pub const VALIDATE: &str = "xcluster.validate";
pub const BOOTSTRAP: &str = "xcluster.bootstrap";
pub const CONFIGURE_STREAM: &str = "xcluster.configure_stream";
pub const UPDATE_CATALOG: &str = "xcluster.update_catalog";
pub const FINALIZE: &str = "xcluster.finalize";
pub const DELETE_STREAM: &str = "xcluster.delete_stream";
pub const REMOVE_CONFIG: &str = "xcluster.remove_config";

/// Pipeline shared by create and edit.
pub const CHANGE_PIPELINE: [&str; 5] = [VALIDATE, BOOTSTRAP, CONFIGURE_STREAM, UPDATE_CATALOG, FINALIZE];

pub const DELETE_PIPELINE: [&str; 2] = [DELETE_STREAM, REMOVE_CONFIG];

/// Everything a step handler may touch.
#[derive(Clone)]
pub struct Services {
    pub repo: Arc<dyn ConfigRepository>,
    pub catalog: Arc<dyn SchemaCatalog>,
    pub backups: Arc<dyn BackupService>,
    pub streams: Arc<dyn ReplicationStreamService>,
    pub waits: OrchestratorConfig,
    pub bootstrap: BootstrapConfig,
}

impl Services {
    pub async fn load(&self, config_id: ConfigId) -> Result<ConfigRecord> {
        self.repo
            .get(config_id)
            .await?
            .ok_or_else(|| Error::not_found("config", config_id))
    }

    pub async fn universe_exists(&self, universe: UniverseId) -> Result<bool> {
        let catalog = &self.catalog;
        with_retry(&catalog.retry_policy(), "universe_exists", move || async move {
            catalog.universe_exists(universe).await
        })
        .await
    }

    pub async fn list_tables(&self, universe: UniverseId) -> Result<SchemaSnapshot> {
        let catalog = &self.catalog;
        with_retry(&catalog.retry_policy(), "list_tables", move || async move {
            catalog.list_tables(universe).await
        })
        .await
    }

    pub async fn has_rows(&self, universe: UniverseId, table_id: &str) -> Result<bool> {
        let catalog = &self.catalog;
        with_retry(&catalog.retry_policy(), "has_rows", move || async move {
            catalog.has_rows(universe, table_id).await
        })
        .await
    }

    /// Storage location for a bootstrap request, falling back to the configured default.
    pub fn storage_location(&self, params: Option<&BootstrapParams>) -> Option<String> {
        params
            .map(|p| p.storage_location.trim())
            .filter(|loc| !loc.is_empty())
            .map(str::to_string)
            .or_else(|| self.bootstrap.default_storage_location.clone())
    }
}

/// Step handlers and failure hooks for every xCluster task kind.
pub fn registry() -> StepRegistry<Services> {
    StepRegistry::new()
        .register(VALIDATE, steps::validate)
        .register(BOOTSTRAP, steps::bootstrap)
        .register(CONFIGURE_STREAM, steps::configure_stream)
        .register(UPDATE_CATALOG, steps::update_catalog)
        .register(FINALIZE, steps::finalize)
        .register(DELETE_STREAM, steps::delete_stream)
        .register(REMOVE_CONFIG, steps::remove_config)
        .on_failure(CREATE_TASK, steps::mark_failed)
        .on_failure(EDIT_TASK, steps::mark_failed)
        .on_failure(DELETE_TASK, steps::mark_failed)
}
