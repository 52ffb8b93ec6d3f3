//! End-to-end rollback scenarios over the in-memory driver.

mod common;

use std::sync::{Arc, Mutex};

use rewind::{EngineError, ErrorKind};
use rewind::changelog::{ChangeLog, RowOp};
use rewind::config::catalog::{MarkRef, SequenceState};
use rewind::drivers::Database;
use rewind::rollback::{CancelToken, RollbackOptions, RollbackStatus};
use serde_json::json;

use common::{FaultyDatabase, database, engine_over, row};

#[test]
fn unlogged_rollback_then_replay_reproduces_prior_contents() {
    //* Given
    let db = database();
    let mut engine = engine_over(db.clone());
    db.insert("public.orders", "1", row(json!({"id": 1, "status": "new"}))).unwrap();
    engine.set_mark(&["sales"], Some("before_batch")).unwrap();
    db.update("public.orders", "1", row(json!({"id": 1, "status": "paid"}))).unwrap();
    db.insert("public.orders", "2", row(json!({"id": 2, "status": "new"}))).unwrap();
    db.insert("public.order_lines", "1", row(json!({"id": 1, "order": 2}))).unwrap();
    db.update("public.orders", "2", row(json!({"id": 2, "status": "void"}))).unwrap();
    db.delete("public.orders", "1").unwrap();
    db.nextval("public.orders_id_seq").unwrap();
    let target = engine
        .catalog()
        .resolve_mark("sales", &"before_batch".into())
        .unwrap()
        .global_seq;
    let expected_orders = db.rows("public.orders").unwrap();
    let expected_lines = db.rows("public.order_lines").unwrap();
    let mut replay = db.records("public.orders", target, u64::MAX).unwrap();
    replay.extend(db.records("public.order_lines", target, u64::MAX).unwrap());
    replay.sort_by_key(|r| r.seq);

    //* When
    let outcome = engine
        .rollback(&["sales"], &"before_batch".into(), false, RollbackOptions::with_sessions(2))
        .unwrap();

    //* Then
    assert_eq!(outcome.status, RollbackStatus::Completed);
    assert_eq!(outcome.unwound_rows, 5);
    assert_eq!(outcome.tables, 2);
    assert_eq!(outcome.sequences, 1);
    let orders = db.rows("public.orders").unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders["1"], row(json!({"id": 1, "status": "new"})));
    assert!(db.rows("public.order_lines").unwrap().is_empty());
    assert!(!db.sequence_state("public.orders_id_seq").unwrap().is_called);

    // Replaying the captured changes forward lands on the pre-rollback state.
    for record in replay {
        match record.op {
            RowOp::Insert => db
                .insert(&record.relation, &record.key, record.after.unwrap())
                .unwrap(),
            RowOp::Update => db
                .update(&record.relation, &record.key, record.after.unwrap())
                .unwrap(),
            RowOp::Delete => db.delete(&record.relation, &record.key).unwrap(),
        }
    }
    assert_eq!(db.rows("public.orders").unwrap(), expected_orders);
    assert_eq!(db.rows("public.order_lines").unwrap(), expected_lines);
}

#[test]
fn logged_rollback_keeps_newer_marks_and_consolidation_reclaims_them() {
    //* Given
    let db = database();
    let mut engine = engine_over(db.clone());
    engine.set_mark(&["sales"], Some("M1")).unwrap();
    db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();
    db.insert("public.orders", "2", row(json!({"id": 2}))).unwrap();
    engine.set_mark(&["sales"], Some("M2")).unwrap();
    db.update("public.orders", "2", row(json!({"id": 2, "note": "x"}))).unwrap();

    //* When
    let outcome = engine
        .rollback(&["sales"], &"M1".into(), true, RollbackOptions::default())
        .unwrap();

    //* Then
    assert_eq!(outcome.unwound_rows, 3);
    assert!(db.rows("public.orders").unwrap().is_empty());
    assert!(engine.catalog().resolve_mark("sales", &"M2".into()).is_ok());
    // Forward changes plus one compensating record each.
    assert_eq!(db.count("public.orders", 0, u64::MAX).unwrap(), 6);

    let report = engine.consolidate_rollback("sales", &"M1".into()).unwrap();
    assert_eq!(report.requests, vec![outcome.request]);
    assert_eq!(report.reclaimed_rows, outcome.unwound_rows);
    assert_eq!(report.purged_records, 2 * outcome.unwound_rows);
    assert_eq!(db.count("public.orders", 0, u64::MAX).unwrap(), 0);
    assert!(engine.catalog().resolve_mark("sales", &"M2".into()).is_err());
    assert!(engine.verify_all().unwrap().is_empty());
}

#[test]
fn five_lock_failures_end_in_deadlock_exceeded_without_locks() {
    //* Given
    let db = database();
    let mut engine = engine_over(db.clone());
    engine.set_mark(&["sales"], Some("M1")).unwrap();
    db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();
    db.insert("public.order_lines", "1", row(json!({"id": 1}))).unwrap();
    db.hold_lock("public.order_lines", "pid 3151").unwrap();

    //* When
    let err = engine
        .rollback(&["sales"], &"M1".into(), false, RollbackOptions::default())
        .unwrap_err();

    //* Then
    match err {
        EngineError::DeadlockExceeded { relation, attempts } => {
            assert_eq!(relation, "public.order_lines");
            assert_eq!(attempts, 5);
        }
        other => panic!("unexpected error: {other}"),
    }
    let request = engine.catalog().requests.last().unwrap();
    assert_eq!(request.status, RollbackStatus::Error);
    assert!(db.locks_of_request(request.id).unwrap().is_empty());
    // Only the external lock remains.
    assert_eq!(db.lock_holders().unwrap().len(), 1);
    assert_eq!(db.rows("public.orders").unwrap().len(), 1);
}

#[test]
fn failure_while_executing_leaves_error_until_cleanup() {
    //* Given
    let db = database();
    let backend = Arc::new(FaultyDatabase::failing_on(db.clone(), "public.customers"));
    let mut engine = engine_over(backend);
    engine.set_mark(&["sales", "crm"], Some("M1")).unwrap();
    db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();
    db.insert("public.customers", "1", row(json!({"id": 1}))).unwrap();

    //* When
    let err = engine
        .rollback(&["sales", "crm"], &"M1".into(), false, RollbackOptions::default())
        .unwrap_err();

    //* Then
    assert!(matches!(err, EngineError::Storage(_)));
    let id = engine.catalog().requests.last().unwrap().id;
    assert_eq!(engine.catalog().request(id).unwrap().status, RollbackStatus::Error);
    // The relation rewound before the failure stays rewound.
    assert!(db.rows("public.orders").unwrap().is_empty());
    assert_eq!(db.rows("public.customers").unwrap().len(), 1);
    assert!(db.locks_of_request(id).unwrap().is_empty());

    let blocked = engine
        .rollback(&["crm"], &"M1".into(), false, RollbackOptions::default())
        .unwrap_err();
    assert!(matches!(blocked, EngineError::InvalidState(_)));
    assert_eq!(engine.get_rollback_activity().len(), 1);

    assert_eq!(engine.cleanup_rollback_state().unwrap(), 1);
    assert_eq!(engine.cleanup_rollback_state().unwrap(), 0);
    assert!(engine.get_rollback_activity().is_empty());
}

#[test]
fn cancellation_between_relations_ends_in_error() {
    //* Given
    let db = database();
    let token = CancelToken::new();
    let backend = Arc::new(FaultyDatabase::cancelling(db.clone(), token.clone()));
    let mut engine = engine_over(backend);
    engine.set_mark(&["sales", "crm"], Some("M1")).unwrap();
    db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();
    db.insert("public.customers", "1", row(json!({"id": 1}))).unwrap();
    let options = RollbackOptions {
        cancel: token,
        ..RollbackOptions::with_sessions(1)
    };

    //* When
    let err = engine
        .rollback(&["sales", "crm"], &"M1".into(), false, options)
        .unwrap_err();

    //* Then
    let EngineError::Cancelled(id) = err else {
        panic!("unexpected error: {err}");
    };
    let request = engine.catalog().request(id).unwrap();
    assert_eq!(request.status, RollbackStatus::Error);
    assert!(db.rows("public.orders").unwrap().is_empty());
    assert_eq!(db.rows("public.customers").unwrap().len(), 1);
    assert!(db.locks_of_request(id).unwrap().is_empty());
}

#[test]
fn parallel_sessions_split_the_work() {
    //* Given
    let db = database();
    let mut engine = engine_over(db.clone());
    engine.set_mark(&["sales", "crm"], Some("M1")).unwrap();
    for i in 0..20 {
        let key = i.to_string();
        db.insert("public.orders", &key, row(json!({"id": i}))).unwrap();
    }
    for i in 0..5 {
        let key = i.to_string();
        db.insert("public.order_lines", &key, row(json!({"id": i}))).unwrap();
        db.insert("public.customers", &key, row(json!({"id": i}))).unwrap();
    }

    //* When
    let estimate = engine
        .estimate_rollback(&["sales", "crm"], &"M1".into(), false, Some(3))
        .unwrap();
    let outcome = engine
        .rollback(&["sales", "crm"], &"M1".into(), false, RollbackOptions::with_sessions(3))
        .unwrap();

    //* Then
    assert!(estimate.advisory);
    assert_eq!(estimate.sessions, 3);
    assert_eq!(estimate.rows, 30);
    assert_eq!(outcome.sessions, 3);
    assert_eq!(outcome.unwound_rows, 30);
    for table in ["public.orders", "public.order_lines", "public.customers"] {
        assert!(db.rows(table).unwrap().is_empty(), "{table} not rewound");
    }
    let request = engine.catalog().request(outcome.request).unwrap();
    assert_eq!(request.plan.len(), 3);
    assert!(db.lock_holders().unwrap().is_empty());
}

#[test]
fn latest_mark_is_a_valid_target() {
    //* Given
    let db = database();
    let mut engine = engine_over(db.clone());
    engine.set_mark(&["crm"], Some("M1")).unwrap();
    db.insert("public.customers", "1", row(json!({"id": 1}))).unwrap();
    engine.set_mark(&["crm"], Some("M2")).unwrap();
    db.insert("public.customers", "2", row(json!({"id": 2}))).unwrap();

    //* When
    engine
        .rollback(&["crm"], &MarkRef::Latest, false, RollbackOptions::default())
        .unwrap();

    //* Then
    let rows = db.rows("public.customers").unwrap();
    assert_eq!(rows.keys().collect::<Vec<_>>(), vec!["1"]);
}

#[test]
fn a_sequence_moved_after_planning_is_still_restored() {
    //* Given
    let db = database();
    let backend = FaultyDatabase::wrapping(db.clone()).after_lock(|inner, relation| {
        if relation == "public.orders" {
            inner.nextval("public.orders_id_seq").unwrap();
        }
    });
    let mut engine = engine_over(Arc::new(backend));
    engine.set_mark(&["sales"], Some("M1")).unwrap();
    db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();

    //* When
    let outcome = engine
        .rollback(&["sales"], &"M1".into(), false, RollbackOptions::with_sessions(1))
        .unwrap();

    //* Then
    assert_eq!(outcome.sequences, 1);
    assert_eq!(
        db.sequence_state("public.orders_id_seq").unwrap(),
        SequenceState {
            last_value: 1,
            is_called: false
        }
    );
    assert!(db.rows("public.orders").unwrap().is_empty());
}

#[test]
fn writes_to_a_locked_table_wait_for_the_rollback() {
    //* Given
    let db = database();
    let refused = Arc::new(Mutex::new(Vec::new()));
    let sink = refused.clone();
    let backend = FaultyDatabase::wrapping(db.clone()).after_lock(move |inner, relation| {
        if let Err(err) = inner.insert(relation, "late", row(json!({"id": "late"}))) {
            sink.lock().unwrap().push(err.kind());
        }
    });
    let mut engine = engine_over(Arc::new(backend));
    engine.set_mark(&["sales"], Some("M1")).unwrap();
    db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();

    //* When
    let outcome = engine
        .rollback(&["sales"], &"M1".into(), false, RollbackOptions::default())
        .unwrap();

    //* Then
    assert_eq!(outcome.status, RollbackStatus::Completed);
    assert_eq!(*refused.lock().unwrap(), vec![ErrorKind::ConcurrencyConflict]);
    assert!(db.rows("public.orders").unwrap().is_empty());
    assert_eq!(db.count("public.orders", 0, u64::MAX).unwrap(), 0);
    db.insert("public.orders", "late", row(json!({"id": "late"}))).unwrap();
}

#[test]
fn a_catalog_write_failing_mid_rollback_ends_in_error() {
    //* Given
    let db = database();
    let backend = FaultyDatabase::wrapping(db.clone()).failing_flush_after_apply();
    let mut engine = engine_over(Arc::new(backend));
    engine.set_mark(&["sales", "crm"], Some("M1")).unwrap();
    db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();
    db.insert("public.customers", "1", row(json!({"id": 1}))).unwrap();

    //* When
    let err = engine
        .rollback(&["sales", "crm"], &"M1".into(), false, RollbackOptions::with_sessions(1))
        .unwrap_err();

    //* Then
    assert!(matches!(err, EngineError::Storage(_)));
    let request = engine.catalog().requests.last().unwrap();
    assert_eq!(request.status, RollbackStatus::Error);
    assert!(request.error.is_some());
    assert!(db.lock_holders().unwrap().is_empty());
    assert!(db.rows("public.orders").unwrap().is_empty());
    assert_eq!(engine.get_rollback_activity().len(), 1);
}
