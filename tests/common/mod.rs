#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rewind::Engine;
use rewind::changelog::{ChangeLog, GlobalSequence, LogRecord, Row};
use rewind::config::catalog::{Catalog, GroupState, RelationKind, SequenceState};
use rewind::config::settings::EngineSettings;
use rewind::drivers::memory::MemoryDatabase;
use rewind::drivers::{Backend, Database, LockConflict, LockOwner};
use rewind::error::{EngineError, EngineResult};
use rewind::rollback::CancelToken;
use rewind::rollback::statement::InverseCommand;

pub fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().expect("row literal must be an object")
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        lock_backoff_ms: 1,
        ..EngineSettings::default()
    }
}

/// `sales`: public.orders, public.order_lines, public.orders_id_seq.
/// `crm`: public.customers. Both logging.
pub fn database() -> Arc<MemoryDatabase> {
    let db = Arc::new(MemoryDatabase::new());
    db.create_table("public.orders").unwrap();
    db.create_table("public.order_lines").unwrap();
    db.create_table("public.customers").unwrap();
    db.create_sequence("public.orders_id_seq", 1).unwrap();
    db
}

pub fn catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.add_group("sales", GroupState::Logging, 0);
    catalog.add_group("crm", GroupState::Logging, 0);
    catalog
        .add_relation("sales", "public.orders", RelationKind::Table)
        .unwrap();
    catalog
        .add_relation("sales", "public.order_lines", RelationKind::Table)
        .unwrap();
    catalog
        .add_relation("sales", "public.orders_id_seq", RelationKind::Sequence)
        .unwrap();
    catalog
        .add_relation("crm", "public.customers", RelationKind::Table)
        .unwrap();
    catalog
}

pub fn engine_over(backend: Arc<dyn Backend>) -> Engine {
    Engine::new(catalog(), backend, settings())
}

/// Runs against the wrapped database at a chosen point of a rollback.
pub type Hook = Box<dyn Fn(&MemoryDatabase, &str) + Send + Sync>;

/// Backend that injects faults around a `MemoryDatabase`: a failing
/// relation, a failing flush, or hooks fired after a lock or an apply.
pub struct FaultyDatabase {
    pub inner: Arc<MemoryDatabase>,
    pub fail_on: Option<String>,
    pub fail_flush_after_apply: bool,
    after_lock: Option<Hook>,
    after_apply: Option<Hook>,
    applied: AtomicBool,
}

impl FaultyDatabase {
    pub fn wrapping(inner: Arc<MemoryDatabase>) -> Self {
        Self {
            inner,
            fail_on: None,
            fail_flush_after_apply: false,
            after_lock: None,
            after_apply: None,
            applied: AtomicBool::new(false),
        }
    }

    pub fn failing_on(inner: Arc<MemoryDatabase>, relation: &str) -> Self {
        Self {
            fail_on: Some(relation.to_string()),
            ..Self::wrapping(inner)
        }
    }

    pub fn cancelling(inner: Arc<MemoryDatabase>, token: CancelToken) -> Self {
        Self::wrapping(inner).after_apply(move |_, _| token.cancel())
    }

    /// Every flush fails once a relation has been rewound.
    pub fn failing_flush_after_apply(mut self) -> Self {
        self.fail_flush_after_apply = true;
        self
    }

    pub fn after_lock(mut self, hook: impl Fn(&MemoryDatabase, &str) + Send + Sync + 'static) -> Self {
        self.after_lock = Some(Box::new(hook));
        self
    }

    pub fn after_apply(mut self, hook: impl Fn(&MemoryDatabase, &str) + Send + Sync + 'static) -> Self {
        self.after_apply = Some(Box::new(hook));
        self
    }
}

impl Database for FaultyDatabase {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn relation_exists(&self, relation: &str) -> EngineResult<bool> {
        self.inner.relation_exists(relation)
    }

    fn try_lock(&self, relation: &str, owner: &LockOwner) -> Result<(), LockConflict> {
        self.inner.try_lock(relation, owner)?;
        if let Some(hook) = &self.after_lock {
            hook(self.inner.as_ref(), relation);
        }
        Ok(())
    }

    fn release_locks(&self, owner: &LockOwner) -> EngineResult<usize> {
        self.inner.release_locks(owner)
    }

    fn locks_of_request(&self, request: u64) -> EngineResult<Vec<String>> {
        self.inner.locks_of_request(request)
    }

    fn apply(
        &self,
        relation: &str,
        commands: &[InverseCommand],
        capture: bool,
        owner: &LockOwner,
    ) -> EngineResult<usize> {
        if self.fail_on.as_deref() == Some(relation) {
            return Err(EngineError::Storage(format!("disk full while writing '{}'", relation)));
        }
        let applied = self.inner.apply(relation, commands, capture, owner)?;
        self.applied.store(true, Ordering::SeqCst);
        if let Some(hook) = &self.after_apply {
            hook(self.inner.as_ref(), relation);
        }
        Ok(applied)
    }

    fn sequence_state(&self, sequence: &str) -> EngineResult<SequenceState> {
        self.inner.sequence_state(sequence)
    }

    fn restore_sequence(&self, sequence: &str, state: SequenceState) -> EngineResult<()> {
        self.inner.restore_sequence(sequence, state)
    }

    fn flush(&self) -> EngineResult<()> {
        if self.fail_flush_after_apply && self.applied.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("catalog volume is read-only".into()));
        }
        self.inner.flush()
    }
}

impl ChangeLog for FaultyDatabase {
    fn records(&self, relation: &str, after: u64, up_to: u64) -> EngineResult<Vec<LogRecord>> {
        self.inner.records(relation, after, up_to)
    }

    fn last_position(&self, relation: &str) -> EngineResult<u64> {
        self.inner.last_position(relation)
    }

    fn bounds(&self, relation: &str) -> EngineResult<Option<(u64, u64)>> {
        self.inner.bounds(relation)
    }

    fn log_relations(&self) -> EngineResult<Vec<String>> {
        self.inner.log_relations()
    }

    fn purge(&self, relation: &str, after: u64, before: u64) -> EngineResult<u64> {
        self.inner.purge(relation, after, before)
    }
}

impl GlobalSequence for FaultyDatabase {
    fn next(&self) -> EngineResult<u64> {
        self.inner.next()
    }

    fn current(&self) -> EngineResult<u64> {
        self.inner.current()
    }
}
