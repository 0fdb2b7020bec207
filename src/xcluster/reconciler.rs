//! Table status reconciliation.
//!
//! [`reconcile`] classifies every table relevant to a config from three
//! inputs: the persisted member rows (declared membership, setup flags and
//! recorded failures), and one schema snapshot per universe. It holds no
//! state between calls, so a table whose schema condition reverses (a dropped
//! table recreated, a missing target table created) moves back on the next
//! pass.
//!
//! Source and target tables are matched by table id first and by
//! `(keyspace, name)` otherwise, since a table recreated on another universe
//! does not keep its id.

use super::types::{
    ConfigStatus, SchemaSnapshot, TableInfo, TableStatus, TableStatusReport, XClusterConfig,
    XClusterTableConfig,
};
use std::collections::{BTreeSet, HashSet};

/// Classify member rows and their same-keyspace siblings.
///
/// Member tables come first in table id order, followed by non-member tables
/// from covered keyspaces (source side, then target side).
pub fn reconcile(
    rows: &[XClusterTableConfig],
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
) -> Vec<TableStatusReport> {
    let mut rows: Vec<&XClusterTableConfig> = rows.iter().collect();
    rows.sort_by(|a, b| a.table_id.cmp(&b.table_id));

    let covered: BTreeSet<&str> = rows.iter().map(|r| r.keyspace.as_str()).collect();
    let declared: HashSet<&str> = rows.iter().map(|r| r.table_id.as_str()).collect();
    let mut matched_target: HashSet<String> = HashSet::new();
    let mut reports = Vec::with_capacity(rows.len());

    for row in rows {
        let on_source = source.get(&row.table_id);
        let (keyspace, name) = match on_source {
            Some(info) => (source.keyspace_of(info), info.name.as_str()),
            None => (row.keyspace.as_str(), row.table_name.as_str()),
        };
        let on_target = locate(target, &row.table_id, keyspace, name, &matched_target);
        if let Some(t) = on_target {
            matched_target.insert(t.id.clone());
        }

        let status = if row.failure.is_some() {
            TableStatus::Failed
        } else {
            match (on_source.is_some(), on_target.is_some()) {
                (true, true) if row.replication_setup_done => TableStatus::Running,
                (true, true) => TableStatus::Bootstrapping,
                (true, false) => TableStatus::ExtraTableOnSource,
                (false, _) => TableStatus::DroppedFromSource,
            }
        };

        reports.push(TableStatusReport {
            table_id: row.table_id.clone(),
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            status,
            member: true,
            source_table_id: on_source.map(|t| t.id.clone()),
            target_table_id: on_target.map(|t| t.id.clone()),
            replication_setup_done: row.replication_setup_done,
            last_error: row.last_error().map(str::to_string),
        });
    }

    for info in source.iter() {
        if declared.contains(info.id.as_str()) {
            continue;
        }
        let keyspace = source.keyspace_of(info);
        if !covered.contains(keyspace) {
            continue;
        }
        let on_target = locate(target, &info.id, keyspace, &info.name, &matched_target);
        if let Some(t) = on_target {
            matched_target.insert(t.id.clone());
        }
        // A sibling present on both sides is an adoption candidate awaiting setup.
        let status = if on_target.is_some() {
            TableStatus::Bootstrapping
        } else {
            TableStatus::ExtraTableOnSource
        };
        reports.push(TableStatusReport {
            table_id: info.id.clone(),
            keyspace: keyspace.to_string(),
            name: info.name.clone(),
            status,
            member: false,
            source_table_id: Some(info.id.clone()),
            target_table_id: on_target.map(|t| t.id.clone()),
            replication_setup_done: false,
            last_error: None,
        });
    }

    for info in target.iter() {
        if matched_target.contains(&info.id) || declared.contains(info.id.as_str()) {
            continue;
        }
        let keyspace = target.keyspace_of(info);
        if !covered.contains(keyspace) {
            continue;
        }
        reports.push(TableStatusReport {
            table_id: info.id.clone(),
            keyspace: keyspace.to_string(),
            name: info.name.clone(),
            status: TableStatus::ExtraTableOnTarget,
            member: false,
            source_table_id: None,
            target_table_id: Some(info.id.clone()),
            replication_setup_done: false,
            last_error: None,
        });
    }

    reports
}

fn locate<'a>(
    snapshot: &'a SchemaSnapshot,
    table_id: &str,
    keyspace: &str,
    name: &str,
    taken: &HashSet<String>,
) -> Option<&'a TableInfo> {
    if let Some(info) = snapshot.get(table_id) {
        return Some(info);
    }
    snapshot
        .iter()
        .find(|t| !taken.contains(&t.id) && t.name == name && snapshot.keyspace_of(t) == keyspace)
}

/// Status the config reports to callers.
///
/// A Running config with a Failed member table reports Failed; every other
/// lifecycle status is reported as stored.
pub fn effective_status(config: &XClusterConfig, reports: &[TableStatusReport]) -> ConfigStatus {
    match config.status {
        ConfigStatus::Running
            if reports
                .iter()
                .any(|r| r.member && !r.status.is_accepted_while_running()) =>
        {
            ConfigStatus::Failed
        }
        status => status,
    }
}

/// Member rows whose persisted status differs from the reconciled one,
/// with the new status applied. Nothing else on the row changes.
pub fn status_updates(
    rows: &[XClusterTableConfig],
    reports: &[TableStatusReport],
) -> Vec<XClusterTableConfig> {
    rows.iter()
        .filter_map(|row| {
            let report = reports
                .iter()
                .find(|r| r.member && r.table_id == row.table_id)?;
            (report.status != row.status).then(|| XClusterTableConfig {
                status: report.status,
                ..row.clone()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xcluster::types::TableFailure;
    use uuid::Uuid;

    fn row(config_id: Uuid, id: &str, keyspace: &str, name: &str, setup: bool) -> XClusterTableConfig {
        let mut row =
            XClusterTableConfig::new(config_id, &TableInfo::new(id, keyspace, name), keyspace);
        row.replication_setup_done = setup;
        row
    }

    fn statuses(reports: &[TableStatusReport]) -> Vec<(String, TableStatus)> {
        reports
            .iter()
            .map(|r| (r.name.clone(), r.status))
            .collect()
    }

    #[test]
    fn test_all_present_and_setup_is_running() {
        let id = Uuid::new_v4();
        let rows = vec![row(id, "t1", "db1", "a", true), row(id, "t2", "db1", "b", true)];
        let source = SchemaSnapshot::new(vec![
            TableInfo::new("t1", "db1", "a"),
            TableInfo::new("t2", "db1", "b"),
        ]);
        let reports = reconcile(&rows, &source, &source.clone());

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == TableStatus::Running));
    }

    #[test]
    fn test_priority_order() {
        let id = Uuid::new_v4();
        let mut failed = row(id, "t4", "db1", "d", true);
        failed.failure = Some(TableFailure::from_operator("forced"));
        let rows = vec![
            row(id, "t1", "db1", "a", false),
            row(id, "t2", "db1", "b", true),
            row(id, "t3", "db1", "c", true),
            failed,
        ];
        let source = SchemaSnapshot::new(vec![
            TableInfo::new("t1", "db1", "a"),
            TableInfo::new("t2", "db1", "b"),
            TableInfo::new("t4", "db1", "d"),
        ]);
        let target = SchemaSnapshot::new(vec![
            TableInfo::new("t1", "db1", "a"),
            TableInfo::new("t3", "db1", "c"),
            TableInfo::new("t4", "db1", "d"),
        ]);

        let reports = reconcile(&rows, &source, &target);
        assert_eq!(
            statuses(&reports),
            vec![
                ("a".to_string(), TableStatus::Bootstrapping),
                ("b".to_string(), TableStatus::ExtraTableOnSource),
                ("c".to_string(), TableStatus::DroppedFromSource),
                ("d".to_string(), TableStatus::Failed),
            ]
        );
        assert_eq!(reports[3].last_error.as_deref(), Some("forced"));
    }

    #[test]
    fn test_matches_target_by_name_when_ids_differ() {
        let id = Uuid::new_v4();
        let rows = vec![
            row(id, "src-1", "db", "test_table_1", true),
            row(id, "src-2", "db", "test_table_2", true),
            row(id, "src-3", "db", "test_table_3", true),
        ];
        // table_1 dropped on source, table_2 dropped on target, table_4 new on both.
        let source = SchemaSnapshot::new(vec![
            TableInfo::new("src-2", "db", "test_table_2"),
            TableInfo::new("src-3", "db", "test_table_3"),
            TableInfo::new("src-4", "db", "test_table_4"),
            TableInfo::new("src-x", "other", "unrelated"),
        ]);
        let target = SchemaSnapshot::new(vec![
            TableInfo::new("tgt-1", "db", "test_table_1"),
            TableInfo::new("tgt-3", "db", "test_table_3"),
            TableInfo::new("tgt-4", "db", "test_table_4"),
            TableInfo::new("tgt-y", "other", "unrelated_target"),
        ]);

        let reports = reconcile(&rows, &source, &target);
        assert_eq!(
            statuses(&reports),
            vec![
                ("test_table_1".to_string(), TableStatus::DroppedFromSource),
                ("test_table_2".to_string(), TableStatus::ExtraTableOnSource),
                ("test_table_3".to_string(), TableStatus::Running),
                ("test_table_4".to_string(), TableStatus::Bootstrapping),
            ]
        );
        assert_eq!(reports[0].target_table_id.as_deref(), Some("tgt-1"));
        assert_eq!(reports[3].target_table_id.as_deref(), Some("tgt-4"));
        assert!(!reports[3].member);
    }

    #[test]
    fn test_new_indexes_classified_by_side() {
        let id = Uuid::new_v4();
        let rows = vec![
            row(id, "t1", "ks", "test_table_1", true),
            row(id, "t2", "ks", "test_table_2", true),
            row(id, "i1", "ks", "test_index_table", true),
        ];
        let mut source_tables = vec![
            TableInfo::new("t1", "ks", "test_table_1"),
            TableInfo::new("t2", "ks", "test_table_2"),
            TableInfo::index("i1", "ks", "test_index_table", "t1"),
        ];
        let mut target_tables = source_tables.clone();
        source_tables.push(TableInfo::index("i3", "ks", "test_index_table_3", "t2"));
        target_tables.push(TableInfo::index("i4", "ks", "test_index_table_4", "t2"));

        let reports = reconcile(
            &rows,
            &SchemaSnapshot::new(source_tables),
            &SchemaSnapshot::new(target_tables),
        );

        assert_eq!(reports.len(), 5);
        let extra_source: Vec<_> = reports
            .iter()
            .filter(|r| r.status == TableStatus::ExtraTableOnSource)
            .map(|r| r.name.as_str())
            .collect();
        let extra_target: Vec<_> = reports
            .iter()
            .filter(|r| r.status == TableStatus::ExtraTableOnTarget)
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(extra_source, vec!["test_index_table_3"]);
        assert_eq!(extra_target, vec!["test_index_table_4"]);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let id = Uuid::new_v4();
        let rows = vec![row(id, "t1", "db1", "a", true), row(id, "t2", "db2", "b", false)];
        let source = SchemaSnapshot::new(vec![
            TableInfo::new("t1", "db1", "a"),
            TableInfo::new("t3", "db1", "c"),
        ]);
        let target = SchemaSnapshot::new(vec![TableInfo::new("t2", "db2", "b")]);

        let first = reconcile(&rows, &source, &target);
        let second = reconcile(&rows, &source, &target);
        assert_eq!(first, second);
    }

    #[test]
    fn test_dropped_table_recovers_when_recreated() {
        let id = Uuid::new_v4();
        let rows = vec![row(id, "t1", "db1", "a", true)];
        let target = SchemaSnapshot::new(vec![TableInfo::new("t1", "db1", "a")]);

        let dropped = reconcile(&rows, &SchemaSnapshot::default(), &target);
        assert_eq!(dropped[0].status, TableStatus::DroppedFromSource);

        let recreated = reconcile(&rows, &target.clone(), &target);
        assert_eq!(recreated[0].status, TableStatus::Running);
    }

    #[test]
    fn test_effective_status_and_updates() {
        let mut config = XClusterConfig::new(
            "c",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Default::default(),
            ["t1".to_string()].into_iter().collect(),
        );
        config.status = ConfigStatus::Running;
        let mut failed = row(config.id, "t1", "db1", "a", true);
        failed.failure = Some(TableFailure::from_operator("boom"));
        let snapshot = SchemaSnapshot::new(vec![TableInfo::new("t1", "db1", "a")]);

        let reports = reconcile(std::slice::from_ref(&failed), &snapshot, &snapshot);
        assert_eq!(effective_status(&config, &reports), ConfigStatus::Failed);

        let updates = status_updates(std::slice::from_ref(&failed), &reports);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, TableStatus::Failed);

        config.status = ConfigStatus::Paused;
        assert_eq!(effective_status(&config, &reports), ConfigStatus::Paused);
    }
}
