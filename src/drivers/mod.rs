use std::fmt;

use crate::changelog::{ChangeLog, GlobalSequence};
use crate::config::catalog::SequenceState;
use crate::error::EngineResult;
use crate::rollback::statement::InverseCommand;

pub mod filesystem;
pub mod memory;
pub mod selector;

/// Identity of a rollback session holding relation locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub request: u64,
    pub session: usize,
}

impl LockOwner {
    /// Lock holder label prefix shared by every session of `request`.
    pub fn request_prefix(request: u64) -> String {
        format!("rlbk#{}/", request)
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s{}", Self::request_prefix(self.request), self.session)
    }
}

/// The lock is held by another transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub relation: String,
    pub holder: String,
}

/// Storage access used by the rollback executor.
pub trait Database: Send + Sync {
    fn name(&self) -> &'static str;

    fn relation_exists(&self, relation: &str) -> EngineResult<bool>;

    /// Take the exclusive lock on `relation` without waiting.
    fn try_lock(&self, relation: &str, owner: &LockOwner) -> Result<(), LockConflict>;

    /// Drop every lock held by `owner`; returns how many were released.
    fn release_locks(&self, owner: &LockOwner) -> EngineResult<usize>;

    /// Relations currently locked by any session of `request`.
    fn locks_of_request(&self, request: u64) -> EngineResult<Vec<String>>;

    /// Apply `commands` to `relation` as one unit: either all of them take
    /// effect or none. The relation must be locked by `owner`. With
    /// `capture`, each applied command is itself appended to the change log.
    fn apply(
        &self,
        relation: &str,
        commands: &[InverseCommand],
        capture: bool,
        owner: &LockOwner,
    ) -> EngineResult<usize>;

    fn sequence_state(&self, sequence: &str) -> EngineResult<SequenceState>;

    fn restore_sequence(&self, sequence: &str, state: SequenceState) -> EngineResult<()>;

    /// Make previous writes durable.
    fn flush(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Everything the engine needs from the underlying database.
pub trait Backend: Database + ChangeLog + GlobalSequence {}

impl<T: Database + ChangeLog + GlobalSequence> Backend for T {}
