//! Config lifecycle rules and synchronous request validation.

use super::types::{BootstrapParams, ConfigStatus, TableId, XClusterConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const EMPTY_MEMBERSHIP_MESSAGE: &str = "The operation to remove tables from replication config will remove all the tables in replication which is not allowed; if you want to delete replication for all of them, please delete the replication config";

impl ConfigStatus {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConfigStatus) -> bool {
        use ConfigStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (_, Failed) => true,
            (Initializing, Running) => true,
            (Running | Failed | Paused, Updating) => true,
            (Updating, Running | Paused) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running | Updating | Paused, DeletedUniverse) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditRequest {
    /// Full desired membership after the edit.
    pub table_ids: BTreeSet<TableId>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapParams>,
    /// Pause (`Paused`) or resume (`Running`) replication.
    #[serde(default)]
    pub status_override: Option<ConfigStatus>,
}

/// Membership delta and status change computed from an [`EditRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPlan {
    pub added: BTreeSet<TableId>,
    pub removed: BTreeSet<TableId>,
    pub status_override: Option<ConfigStatus>,
    pub prior_status: ConfigStatus,
}

impl EditPlan {
    pub fn changes_tables(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Rejects an edit that would leave the config without tables.
///
/// Runs before anything else so the answer never depends on a status
/// override or on the config's current state.
pub fn check_not_emptied(request: &EditRequest) -> Result<()> {
    if request.table_ids.is_empty() {
        return Err(Error::Validation(EMPTY_MEMBERSHIP_MESSAGE.to_string()));
    }
    Ok(())
}

pub fn plan_edit(config: &XClusterConfig, request: &EditRequest) -> Result<EditPlan> {
    check_not_emptied(request)?;

    if let Some(status) = request.status_override {
        if !matches!(status, ConfigStatus::Running | ConfigStatus::Paused) {
            return Err(Error::Validation(format!(
                "status override must be Running or Paused, got {}",
                status
            )));
        }
    }

    let added: BTreeSet<TableId> = request
        .table_ids
        .difference(&config.table_ids)
        .cloned()
        .collect();
    let removed: BTreeSet<TableId> = config
        .table_ids
        .difference(&request.table_ids)
        .cloned()
        .collect();
    let status_override = request
        .status_override
        .filter(|status| *status != config.status);

    let plan = EditPlan {
        added,
        removed,
        status_override,
        prior_status: config.status,
    };

    if !plan.changes_tables() && plan.status_override.is_none() {
        return Err(Error::Validation(
            "edit request does not change tables or status".to_string(),
        ));
    }

    match config.status {
        ConfigStatus::Running | ConfigStatus::Failed => {}
        ConfigStatus::Paused if !plan.changes_tables() => {}
        ConfigStatus::Paused => {
            return Err(Error::Validation(
                "replication is paused; resume it before changing tables".to_string(),
            ))
        }
        status => {
            return Err(Error::Validation(format!(
                "config {} cannot be edited while {}",
                config.id, status
            )))
        }
    }

    if plan.status_override == Some(ConfigStatus::Paused) && config.status == ConfigStatus::Failed
    {
        return Err(Error::Validation(
            "a failed config cannot be paused; fix or delete it first".to_string(),
        ));
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn config(status: ConfigStatus, tables: &[&str]) -> XClusterConfig {
        let mut config = XClusterConfig::new(
            "repl",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Default::default(),
            tables.iter().map(|t| t.to_string()).collect(),
        );
        config.status = status;
        config
    }

    fn request(tables: &[&str], status: Option<ConfigStatus>) -> EditRequest {
        EditRequest {
            table_ids: tables.iter().map(|t| t.to_string()).collect(),
            bootstrap: None,
            status_override: status,
        }
    }

    #[test]
    fn test_empty_edit_rejected_regardless_of_override() {
        let cfg = config(ConfigStatus::Running, &["a", "b"]);
        for status in [None, Some(ConfigStatus::Paused), Some(ConfigStatus::Running)] {
            let err = plan_edit(&cfg, &request(&[], status)).unwrap_err();
            match err {
                Error::Validation(msg) => assert!(msg.contains("please delete the replication config")),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_plan_computes_delta() {
        let cfg = config(ConfigStatus::Failed, &["a", "b", "c"]);
        let plan = plan_edit(&cfg, &request(&["a", "d"], None)).unwrap();
        assert_eq!(plan.added, ["d".to_string()].into_iter().collect());
        assert_eq!(
            plan.removed,
            ["b".to_string(), "c".to_string()].into_iter().collect()
        );
        assert_eq!(plan.prior_status, ConfigStatus::Failed);
    }

    #[test]
    fn test_no_op_edit_rejected() {
        let cfg = config(ConfigStatus::Running, &["a"]);
        assert!(plan_edit(&cfg, &request(&["a"], None)).is_err());
        assert!(plan_edit(&cfg, &request(&["a"], Some(ConfigStatus::Running))).is_err());
        assert!(plan_edit(&cfg, &request(&["a"], Some(ConfigStatus::Paused))).is_ok());
    }

    #[test]
    fn test_paused_config_only_accepts_resume() {
        let cfg = config(ConfigStatus::Paused, &["a"]);
        assert!(plan_edit(&cfg, &request(&["a", "b"], None)).is_err());
        let plan = plan_edit(&cfg, &request(&["a"], Some(ConfigStatus::Running))).unwrap();
        assert_eq!(plan.status_override, Some(ConfigStatus::Running));
    }

    #[test]
    fn test_in_flight_states_rejected() {
        for status in [
            ConfigStatus::Initializing,
            ConfigStatus::Updating,
            ConfigStatus::DeletedUniverse,
        ] {
            let cfg = config(status, &["a"]);
            assert!(plan_edit(&cfg, &request(&["a", "b"], None)).is_err());
        }
    }

    #[test]
    fn test_transitions() {
        use ConfigStatus::*;
        assert!(Initializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Updating));
        assert!(Updating.can_transition_to(Running));
        assert!(Paused.can_transition_to(Running));
        assert!(Updating.can_transition_to(DeletedUniverse));
        assert!(!Initializing.can_transition_to(Paused));
        assert!(!DeletedUniverse.can_transition_to(Running));
    }
}
