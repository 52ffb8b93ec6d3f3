mod common;

use std::sync::Arc;

use rewind::Engine;
use rewind::config::catalog::{GroupState, RelationKind};
use rewind::drivers::Database;
use rewind::drivers::memory::MemoryDatabase;
use rewind::rollback::{RollbackOptions, RollbackStatus};
use rewind::storage::Workspace;
use serde_json::json;

use common::row;

fn seeded_workspace(root: &std::path::Path) -> (Engine, Arc<MemoryDatabase>) {
    let ws = Workspace::init_at(root).unwrap();
    let db = Arc::new(MemoryDatabase::open(&ws.dir().join("data.json")).unwrap());
    db.create_table("public.accounts").unwrap();
    db.create_sequence("public.accounts_id_seq", 100).unwrap();
    db.flush().unwrap();

    let mut engine = Engine::open_with_backend(ws, db.clone()).unwrap();
    engine.settings_mut().lock_backoff_ms = 1;
    let catalog = engine.catalog_mut();
    catalog.add_group("ledger", GroupState::Logging, 0);
    catalog
        .add_relation("ledger", "public.accounts", RelationKind::Table)
        .unwrap();
    catalog
        .add_relation("ledger", "public.accounts_id_seq", RelationKind::Sequence)
        .unwrap();
    engine.commit().unwrap();
    (engine, db)
}

#[test]
fn init_refuses_an_existing_workspace() {
    //* Given
    let dir = tempfile::tempdir().unwrap();
    Workspace::init_at(dir.path()).unwrap();

    //* When
    let result = Workspace::init_at(dir.path());

    //* Then
    assert!(result.is_err());
    let nested = dir.path().join("a").join("b");
    std::fs::create_dir_all(&nested).unwrap();
    let found = Workspace::find_from(&nested).unwrap();
    assert_eq!(found.root(), dir.path());
}

#[test]
fn marks_and_rollbacks_survive_a_reopen() {
    //* Given
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, db) = seeded_workspace(dir.path());
    db.insert("public.accounts", "1", row(json!({"id": 1, "balance": 10})))
        .unwrap();
    engine.set_mark(&["ledger"], Some("close")).unwrap();
    db.update("public.accounts", "1", row(json!({"id": 1, "balance": 0})))
        .unwrap();
    db.nextval("public.accounts_id_seq").unwrap();
    db.insert("public.accounts", "2", row(json!({"id": 2, "balance": 5})))
        .unwrap();

    //* When
    let outcome = engine
        .rollback(&["ledger"], &"close".into(), false, RollbackOptions::default())
        .unwrap();
    drop(engine);
    drop(db);

    //* Then
    let reopened = Engine::open(Workspace::at(dir.path())).unwrap();
    let request = reopened.catalog().request(outcome.request).unwrap();
    assert_eq!(request.status, RollbackStatus::Completed);
    assert_eq!(request.unwound_rows, 2);
    assert!(reopened.catalog().resolve_mark("ledger", &"close".into()).is_ok());
    assert!(reopened.verify_all().unwrap().is_empty());

    let data = MemoryDatabase::open(&dir.path().join(".rewind").join("data.json")).unwrap();
    let rows = data.rows("public.accounts").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows["1"], row(json!({"id": 1, "balance": 10})));
    let seq = data.sequence_state("public.accounts_id_seq").unwrap();
    assert_eq!(seq.last_value, 100);
    assert!(!seq.is_called);
}

#[test]
fn a_rollback_script_leaves_the_data_alone() {
    //* Given
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, db) = seeded_workspace(dir.path());
    engine.set_mark(&["ledger"], Some("start")).unwrap();
    db.insert("public.accounts", "7", row(json!({"id": 7}))).unwrap();
    let script = dir.path().join("undo.sql");

    //* When
    let statements = engine
        .export_rollback_script(&["ledger"], &"start".into(), &script)
        .unwrap();

    //* Then
    assert_eq!(statements, 2);
    let text = std::fs::read_to_string(&script).unwrap();
    assert!(text.lines().any(|l| l == "BEGIN;"));
    // The sequence was never used after the mark; it is reset all the same.
    assert!(text.contains("SELECT setval('public.accounts_id_seq', 100, false);"));
    assert!(text.contains("DELETE FROM public.accounts WHERE id = '7';"));
    assert!(text.trim_end().ends_with("COMMIT;"));
    assert_eq!(db.rows("public.accounts").unwrap().len(), 1);
    assert!(engine.catalog().requests.is_empty());
}
