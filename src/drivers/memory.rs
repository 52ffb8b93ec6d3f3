use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::Local;
use serde::{Deserialize, Serialize};

use super::{Database, LockConflict, LockOwner};
use crate::changelog::{ChangeLog, GlobalSequence, LogRecord, Row, RowOp};
use crate::config::catalog::SequenceState;
use crate::error::{EngineError, EngineResult};
use crate::rollback::statement::InverseCommand;

/// Serializable content of a database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseState {
    pub global_seq: u64,
    pub tables: BTreeMap<String, BTreeMap<String, Row>>,
    pub sequences: BTreeMap<String, SequenceState>,
    /// One log store per logged table.
    pub log: BTreeMap<String, Vec<LogRecord>>,
}

/// Database kept in process memory, optionally backed by a JSON file.
///
/// DML issued through `insert`/`update`/`delete` is captured in the change
/// log of the table, which stands in for the capture triggers. Table locks
/// are exclusive: that DML is refused while anyone holds the table.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    pub(super) state: Mutex<DatabaseState>,
    locks: Mutex<BTreeMap<String, String>>,
    pub(super) path: Option<PathBuf>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: DatabaseState) -> Self {
        Self {
            state: Mutex::new(state),
            locks: Mutex::new(BTreeMap::new()),
            path: None,
        }
    }

    pub(super) fn state(&self) -> EngineResult<MutexGuard<'_, DatabaseState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Internal("database state lock poisoned".into()))
    }

    fn locks(&self) -> EngineResult<MutexGuard<'_, BTreeMap<String, String>>> {
        self.locks
            .lock()
            .map_err(|_| EngineError::Internal("lock table poisoned".into()))
    }

    /// Lock table guard, provided nobody holds `relation`. Keep it alive
    /// until the write is done.
    fn unlocked(&self, relation: &str) -> EngineResult<MutexGuard<'_, BTreeMap<String, String>>> {
        let locks = self.locks()?;
        if let Some(holder) = locks.get(relation) {
            return Err(EngineError::RelationLocked {
                relation: relation.to_string(),
                holder: holder.clone(),
            });
        }
        Ok(locks)
    }

    /// Create a table with its log store.
    pub fn create_table(&self, table: &str) -> EngineResult<()> {
        let mut state = self.state()?;
        state.tables.entry(table.to_string()).or_default();
        state.log.entry(table.to_string()).or_default();
        Ok(())
    }

    /// Create a table whose changes are not captured.
    pub fn create_unlogged_table(&self, table: &str) -> EngineResult<()> {
        self.state()?.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> EngineResult<()> {
        self.state()?.tables.remove(table);
        Ok(())
    }

    pub fn create_sequence(&self, sequence: &str, start: i64) -> EngineResult<()> {
        self.state()?.sequences.insert(
            sequence.to_string(),
            SequenceState {
                last_value: start,
                is_called: false,
            },
        );
        Ok(())
    }

    pub fn nextval(&self, sequence: &str) -> EngineResult<i64> {
        let mut state = self.state()?;
        let seq = state
            .sequences
            .get_mut(sequence)
            .ok_or_else(|| EngineError::UnknownRelation(sequence.to_string()))?;
        if seq.is_called {
            seq.last_value += 1;
        } else {
            seq.is_called = true;
        }
        Ok(seq.last_value)
    }

    pub fn insert(&self, table: &str, key: &str, row: Row) -> EngineResult<()> {
        let _locks = self.unlocked(table)?;
        let mut state = self.state()?;
        let rows = table_mut(&mut state, table)?;
        if rows.contains_key(key) {
            return Err(EngineError::Storage(format!(
                "duplicate key '{}' in '{}'",
                key, table
            )));
        }
        rows.insert(key.to_string(), row.clone());
        capture(&mut state, table, RowOp::Insert, key, None, Some(row));
        Ok(())
    }

    pub fn update(&self, table: &str, key: &str, row: Row) -> EngineResult<()> {
        let _locks = self.unlocked(table)?;
        let mut state = self.state()?;
        let rows = table_mut(&mut state, table)?;
        let before = rows
            .insert(key.to_string(), row.clone())
            .ok_or_else(|| missing_row(table, key))?;
        capture(&mut state, table, RowOp::Update, key, Some(before), Some(row));
        Ok(())
    }

    pub fn delete(&self, table: &str, key: &str) -> EngineResult<()> {
        let _locks = self.unlocked(table)?;
        let mut state = self.state()?;
        let rows = table_mut(&mut state, table)?;
        let before = rows.remove(key).ok_or_else(|| missing_row(table, key))?;
        capture(&mut state, table, RowOp::Delete, key, Some(before), None);
        Ok(())
    }

    pub fn rows(&self, table: &str) -> EngineResult<BTreeMap<String, Row>> {
        let state = self.state()?;
        state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRelation(table.to_string()))
    }

    /// Lock `relation` on behalf of a transaction outside the engine.
    pub fn hold_lock(&self, relation: &str, holder: &str) -> EngineResult<()> {
        self.locks()?
            .insert(relation.to_string(), holder.to_string());
        Ok(())
    }

    pub fn drop_lock(&self, relation: &str) -> EngineResult<()> {
        self.locks()?.remove(relation);
        Ok(())
    }

    pub fn lock_holders(&self) -> EngineResult<BTreeMap<String, String>> {
        Ok(self.locks()?.clone())
    }

    pub fn snapshot(&self) -> EngineResult<DatabaseState> {
        Ok(self.state()?.clone())
    }
}

fn table_mut<'a>(
    state: &'a mut DatabaseState,
    table: &str,
) -> EngineResult<&'a mut BTreeMap<String, Row>> {
    state
        .tables
        .get_mut(table)
        .ok_or_else(|| EngineError::UnknownRelation(table.to_string()))
}

fn missing_row(table: &str, key: &str) -> EngineError {
    EngineError::Storage(format!("no row with key '{}' in '{}'", key, table))
}

fn capture(
    state: &mut DatabaseState,
    table: &str,
    op: RowOp,
    key: &str,
    before: Option<Row>,
    after: Option<Row>,
) {
    if !state.log.contains_key(table) {
        return;
    }
    state.global_seq += 1;
    let record = LogRecord {
        seq: state.global_seq,
        relation: table.to_string(),
        op,
        key: key.to_string(),
        before,
        after,
        at: Local::now(),
    };
    state.log.entry(table.to_string()).or_default().push(record);
}

impl Database for MemoryDatabase {
    fn name(&self) -> &'static str {
        if self.path.is_some() { "file" } else { "memory" }
    }

    fn relation_exists(&self, relation: &str) -> EngineResult<bool> {
        let state = self.state()?;
        Ok(state.tables.contains_key(relation) || state.sequences.contains_key(relation))
    }

    fn try_lock(&self, relation: &str, owner: &LockOwner) -> Result<(), LockConflict> {
        let label = owner.to_string();
        let mut locks = self.locks.lock().map_err(|_| LockConflict {
            relation: relation.to_string(),
            holder: "poisoned lock table".to_string(),
        })?;
        match locks.get(relation) {
            Some(holder) if *holder != label => Err(LockConflict {
                relation: relation.to_string(),
                holder: holder.clone(),
            }),
            _ => {
                locks.insert(relation.to_string(), label);
                Ok(())
            }
        }
    }

    fn release_locks(&self, owner: &LockOwner) -> EngineResult<usize> {
        let label = owner.to_string();
        let mut locks = self.locks()?;
        let before = locks.len();
        locks.retain(|_, holder| *holder != label);
        Ok(before - locks.len())
    }

    fn locks_of_request(&self, request: u64) -> EngineResult<Vec<String>> {
        let prefix = LockOwner::request_prefix(request);
        Ok(self
            .locks()?
            .iter()
            .filter(|(_, holder)| holder.starts_with(&prefix))
            .map(|(relation, _)| relation.clone())
            .collect())
    }

    fn apply(
        &self,
        relation: &str,
        commands: &[InverseCommand],
        capture_changes: bool,
        owner: &LockOwner,
    ) -> EngineResult<usize> {
        // Held until the table is written, so the lock cannot move meanwhile.
        let locks = self.locks()?;
        if locks.get(relation).map(String::as_str) != Some(owner.to_string().as_str()) {
            return Err(EngineError::Internal(format!(
                "'{}' is not locked by {}",
                relation, owner
            )));
        }

        let mut state = self.state()?;
        let mut rows = state
            .tables
            .get(relation)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRelation(relation.to_string()))?;

        // Work on a copy so a failing command leaves the table untouched.
        let mut captured = Vec::with_capacity(commands.len());
        for command in commands {
            let key = command.key().to_string();
            match command {
                InverseCommand::DeleteRow { .. } => {
                    let before = rows.remove(&key).ok_or_else(|| missing_row(relation, &key))?;
                    captured.push((RowOp::Delete, key, Some(before), None));
                }
                InverseCommand::InsertRow { row, .. } => {
                    if rows.contains_key(&key) {
                        return Err(EngineError::Storage(format!(
                            "duplicate key '{}' in '{}'",
                            key, relation
                        )));
                    }
                    rows.insert(key.clone(), row.clone());
                    captured.push((RowOp::Insert, key, None, Some(row.clone())));
                }
                InverseCommand::RestoreRow { row, .. } => {
                    let before = rows
                        .insert(key.clone(), row.clone())
                        .ok_or_else(|| missing_row(relation, &key))?;
                    captured.push((RowOp::Update, key, Some(before), Some(row.clone())));
                }
            }
        }

        state.tables.insert(relation.to_string(), rows);
        if capture_changes {
            for (op, key, before, after) in captured {
                capture(&mut state, relation, op, &key, before, after);
            }
        }
        Ok(commands.len())
    }

    fn sequence_state(&self, sequence: &str) -> EngineResult<SequenceState> {
        self.state()?
            .sequences
            .get(sequence)
            .copied()
            .ok_or_else(|| EngineError::UnknownRelation(sequence.to_string()))
    }

    fn restore_sequence(&self, sequence: &str, value: SequenceState) -> EngineResult<()> {
        let mut state = self.state()?;
        let current = state
            .sequences
            .get_mut(sequence)
            .ok_or_else(|| EngineError::UnknownRelation(sequence.to_string()))?;
        *current = value;
        Ok(())
    }

    fn flush(&self) -> EngineResult<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }
}

impl ChangeLog for MemoryDatabase {
    fn records(&self, relation: &str, after: u64, up_to: u64) -> EngineResult<Vec<LogRecord>> {
        let state = self.state()?;
        Ok(state
            .log
            .get(relation)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.seq > after && r.seq <= up_to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn count(&self, relation: &str, after: u64, up_to: u64) -> EngineResult<u64> {
        let state = self.state()?;
        Ok(state
            .log
            .get(relation)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.seq > after && r.seq <= up_to)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    fn last_position(&self, relation: &str) -> EngineResult<u64> {
        Ok(self
            .state()?
            .log
            .get(relation)
            .and_then(|records| records.last())
            .map(|r| r.seq)
            .unwrap_or(0))
    }

    fn bounds(&self, relation: &str) -> EngineResult<Option<(u64, u64)>> {
        let state = self.state()?;
        Ok(state.log.get(relation).and_then(|records| {
            match (records.first(), records.last()) {
                (Some(first), Some(last)) => Some((first.seq, last.seq)),
                _ => None,
            }
        }))
    }

    fn log_relations(&self) -> EngineResult<Vec<String>> {
        Ok(self.state()?.log.keys().cloned().collect())
    }

    fn purge(&self, relation: &str, after: u64, before: u64) -> EngineResult<u64> {
        let mut state = self.state()?;
        let Some(records) = state.log.get_mut(relation) else {
            return Ok(0);
        };
        let len = records.len();
        records.retain(|r| r.seq <= after || r.seq >= before);
        Ok((len - records.len()) as u64)
    }
}

impl GlobalSequence for MemoryDatabase {
    fn next(&self) -> EngineResult<u64> {
        let mut state = self.state()?;
        state.global_seq += 1;
        Ok(state.global_seq)
    }

    fn current(&self) -> EngineResult<u64> {
        Ok(self.state()?.global_seq)
    }
}
