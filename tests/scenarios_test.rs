mod common;

use common::{ids, report, Harness};
use xcluster_ctl::task::TaskState;
use xcluster_ctl::xcluster::lifecycle::EMPTY_MEMBERSHIP_MESSAGE;
use xcluster_ctl::xcluster::{ConfigStatus, EditRequest, TableInfo, TableStatus};
use xcluster_ctl::Error;

fn four_tables(h: &Harness) {
    h.table_on_both("t1", "db1", "orders");
    h.table_on_both("t2", "db1", "items");
    h.table_on_both("t3", "db2", "users");
    h.table_on_both("t4", "db2", "events");
}

#[tokio::test]
async fn test_create_two_keyspaces_all_running() {
    let h = Harness::new();
    four_tables(&h);

    let config_id = h.create("repl", &["t1", "t2", "t3", "t4"]).await;

    let snapshot = h.service.get(config_id).await.unwrap();
    assert_eq!(snapshot.config.status, ConfigStatus::Running);
    assert_eq!(snapshot.effective_status, ConfigStatus::Running);
    assert_eq!(snapshot.tables.len(), 4);
    for table in &snapshot.tables {
        assert!(table.member);
        assert!(table.replication_setup_done);
        assert_eq!(table.status, TableStatus::Running, "table {}", table.name);
    }

    let record = h.service.services().load(config_id).await.unwrap();
    assert!(record
        .tables
        .values()
        .all(|row| row.keyspace == "db1" || row.keyspace == "db2"));
    assert_eq!(record.tables.len(), record.config.table_ids.len());

    let stream = h.universes.stream(config_id).unwrap();
    assert_eq!(stream.tables, ids(&["t1", "t2", "t3", "t4"]));
    assert!(!stream.paused);
    // Empty tables present on both sides need no seed.
    assert_eq!(h.universes.backups_started(), 0);
}

#[tokio::test]
async fn test_table_dropped_from_source_is_reported_and_reversible() {
    let h = Harness::new();
    four_tables(&h);
    let config_id = h.create("repl", &["t1", "t2", "t3", "t4"]).await;

    assert!(h.universes.drop_table(h.source, "t2"));
    let snapshot = h.service.get(config_id).await.unwrap();
    assert_eq!(report(&snapshot, "items").status, TableStatus::DroppedFromSource);
    assert_eq!(report(&snapshot, "orders").status, TableStatus::Running);
    // Schema drift alone does not make the config unhealthy.
    assert_eq!(snapshot.effective_status, ConfigStatus::Running);

    h.universes
        .create_table(h.source, TableInfo::new("t2", "db1", "items"));
    let snapshot = h.service.get(config_id).await.unwrap();
    assert_eq!(report(&snapshot, "items").status, TableStatus::Running);
}

#[tokio::test]
async fn test_sibling_tables_surface_as_extra() {
    let h = Harness::new();
    h.table_on_both("t1", "db1", "orders");
    let config_id = h.create("repl", &["t1"]).await;

    h.universes
        .create_table(h.source, TableInfo::new("t5", "db1", "audit"));
    h.universes
        .create_table(h.target, TableInfo::new("x9", "db1", "ghost"));
    h.universes
        .create_table(h.source, TableInfo::new("u1", "db9", "unrelated"));

    let snapshot = h.service.get(config_id).await.unwrap();
    let audit = report(&snapshot, "audit");
    assert!(!audit.member);
    assert_eq!(audit.status, TableStatus::ExtraTableOnSource);
    assert_eq!(report(&snapshot, "ghost").status, TableStatus::ExtraTableOnTarget);
    assert!(snapshot.tables.iter().all(|t| t.name != "unrelated"));

    // Once the target catches up the sibling is ready to be added.
    h.universes
        .create_table(h.target, TableInfo::new("tgt-t5", "db1", "audit"));
    let snapshot = h.service.get(config_id).await.unwrap();
    assert_eq!(report(&snapshot, "audit").status, TableStatus::Bootstrapping);
    assert_eq!(snapshot.effective_status, ConfigStatus::Running);
}

#[tokio::test]
async fn test_concurrent_edits_conflict() {
    let h = Harness::new();
    h.table_on_both("t1", "db1", "orders");
    h.table_on_both("t2", "db1", "items");
    h.table_on_both("t3", "db1", "users");
    let config_id = h.create("repl", &["t1"]).await;

    h.universes.hold_setup("t2");
    h.universes.hold_setup("t3");
    let add_t2 = EditRequest {
        table_ids: ids(&["t1", "t2"]),
        ..Default::default()
    };
    let add_t3 = EditRequest {
        table_ids: ids(&["t1", "t3"]),
        ..Default::default()
    };

    let (first, second) = tokio::join!(
        h.service.edit(config_id, add_t2),
        h.service.edit(config_id, add_t3)
    );
    let (winner, conflict) = match (first, second) {
        (Ok(handle), Err(e)) | (Err(e), Ok(handle)) => (handle, e),
        (first, second) => panic!(
            "expected exactly one conflict, got {:?} and {:?}",
            first.map(|h| h.id()),
            second.map(|h| h.id())
        ),
    };
    assert!(matches!(conflict, Error::ConcurrencyConflict { holder, .. } if holder == winner.id()));

    h.universes.release_setup("t2");
    h.universes.release_setup("t3");
    let task = winner.wait().await.unwrap();
    assert_eq!(task.state, TaskState::Success);

    let snapshot = h.service.get(config_id).await.unwrap();
    assert_eq!(snapshot.config.status, ConfigStatus::Running);
    assert_eq!(snapshot.member_tables().count(), 2);
    assert!(snapshot
        .member_tables()
        .all(|t| t.status == TableStatus::Running));
}

#[tokio::test]
async fn test_shrink_after_failure_then_reject_empty_edit() {
    let h = Harness::new();
    four_tables(&h);
    let config_id = h.create("repl", &["t1", "t2", "t3", "t4"]).await;

    let snapshot = h
        .service
        .mark_tables_failed(config_id, &ids(&["t3", "t4"]), "replication lag exceeded")
        .await
        .unwrap();
    assert_eq!(snapshot.effective_status, ConfigStatus::Failed);
    let users = report(&snapshot, "users");
    assert_eq!(users.status, TableStatus::Failed);
    assert_eq!(users.last_error.as_deref(), Some("replication lag exceeded"));

    let task = h
        .service
        .edit(
            config_id,
            EditRequest {
                table_ids: ids(&["t1", "t2"]),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Success, "{:?}", task.error);

    let snapshot = h.service.get(config_id).await.unwrap();
    assert_eq!(snapshot.config.table_ids, ids(&["t1", "t2"]));
    assert_eq!(snapshot.effective_status, ConfigStatus::Running);
    assert_eq!(snapshot.tables.len(), 2);
    assert!(snapshot.tables.iter().all(|t| t.status == TableStatus::Running));
    assert_eq!(h.universes.stream(config_id).unwrap().tables, ids(&["t1", "t2"]));

    let err = h
        .service
        .edit(
            config_id,
            EditRequest {
                table_ids: ids(&[]),
                status_override: Some(ConfigStatus::Paused),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        Error::Validation(msg) => assert_eq!(msg, EMPTY_MEMBERSHIP_MESSAGE),
        other => panic!("unexpected error: {other}"),
    }
    // The rejected edit left nothing behind.
    let snapshot = h.service.get(config_id).await.unwrap();
    assert_eq!(snapshot.config.status, ConfigStatus::Running);
}

#[tokio::test]
async fn test_create_rejects_duplicates_and_overlap() {
    let h = Harness::new();
    four_tables(&h);
    h.create("repl", &["t1", "t2"]).await;

    let err = h.service.create(h.request("repl", &["t3"])).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h
        .service
        .create(h.request("other", &["t2", "t3"]))
        .await
        .unwrap_err();
    match err {
        Error::Validation(msg) => assert!(msg.contains("t2"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }

    let err = h
        .service
        .create(h.request("missing", &["nope"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let mut same_universe = h.request("loop", &["t3"]);
    same_universe.target = same_universe.source;
    assert!(matches!(
        h.service.create(same_universe).await,
        Err(Error::Validation(_))
    ));

    assert_eq!(h.service.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_by_status_filters_reports() {
    let h = Harness::new();
    four_tables(&h);
    let config_id = h.create("repl", &["t1", "t2"]).await;
    h.service
        .mark_tables_failed(config_id, &ids(&["t2"]), "checksum mismatch")
        .await
        .unwrap();

    let failed = h
        .service
        .list_by_status(config_id, TableStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].table_id, "t2");

    let err = h
        .service
        .mark_tables_failed(config_id, &ids(&["t3"]), "not a member")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_edit_keeps_operator_failure_on_retained_table() {
    let h = Harness::new();
    four_tables(&h);
    let config_id = h.create("repl", &["t1", "t2"]).await;
    h.service
        .mark_tables_failed(config_id, &ids(&["t2"]), "operator forced")
        .await
        .unwrap();

    let task = h
        .service
        .edit(
            config_id,
            EditRequest {
                table_ids: ids(&["t1", "t2", "t3"]),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Success, "{:?}", task.error);

    let snapshot = h.service.get(config_id).await.unwrap();
    assert_eq!(snapshot.config.table_ids, ids(&["t1", "t2", "t3"]));
    assert_eq!(report(&snapshot, "users").status, TableStatus::Running);
    assert_eq!(report(&snapshot, "orders").status, TableStatus::Running);
    let items = report(&snapshot, "items");
    assert_eq!(items.status, TableStatus::Failed);
    assert_eq!(items.last_error.as_deref(), Some("operator forced"));
    assert_eq!(snapshot.effective_status, ConfigStatus::Failed);
}
