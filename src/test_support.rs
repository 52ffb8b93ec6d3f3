use std::sync::Arc;

use chrono::Local;

use crate::changelog::Row;
use crate::config::catalog::{Catalog, GroupState, RelationKind};
use crate::config::settings::EngineSettings;
use crate::drivers::memory::MemoryDatabase;
use crate::engine::Engine;
use crate::rollback::{RollbackRequest, RollbackStatus};

pub(crate) fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().expect("row literal must be an object")
}

/// `myGroup1`: public.orders + public.orders_id_seq,
/// `myGroup2`: public.customers. Both groups are logging.
pub(crate) fn fixture() -> (Engine, Arc<MemoryDatabase>) {
    let db = Arc::new(MemoryDatabase::new());
    db.create_table("public.orders").unwrap();
    db.create_table("public.customers").unwrap();
    db.create_sequence("public.orders_id_seq", 1).unwrap();

    let mut catalog = Catalog::new();
    catalog.add_group("myGroup1", GroupState::Logging, 0);
    catalog.add_group("myGroup2", GroupState::Logging, 0);
    catalog
        .add_relation("myGroup1", "public.orders", RelationKind::Table)
        .unwrap();
    catalog
        .add_relation("myGroup1", "public.orders_id_seq", RelationKind::Sequence)
        .unwrap();
    catalog
        .add_relation("myGroup2", "public.customers", RelationKind::Table)
        .unwrap();

    let settings = EngineSettings {
        lock_backoff_ms: 1,
        ..EngineSettings::default()
    };
    let engine = Engine::new(catalog, db.clone(), settings);
    (engine, db)
}

/// A blank request record in PLANNING state.
pub(crate) fn request(id: u64, groups: &[&str]) -> RollbackRequest {
    let now = Local::now();
    RollbackRequest {
        id,
        groups: groups.iter().map(|g| g.to_string()).collect(),
        target_mark: "M1".into(),
        target_seq: 1,
        logged: false,
        requested_sessions: 1,
        sessions: 1,
        status: RollbackStatus::Planning,
        transitions: Vec::new(),
        started_at: now,
        last_activity: now,
        table_count: 0,
        sequence_count: 0,
        estimated_micros: 0,
        done_micros: 0,
        unwound_rows: 0,
        start_mark: None,
        start_seq: None,
        done_mark: None,
        done_seq: None,
        error: None,
        cleaned: false,
        consolidated: false,
        plan: Vec::new(),
        session_records: Vec::new(),
        stats: Vec::new(),
    }
}
