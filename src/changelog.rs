// Change Log Access
//
// Read side of the capture layer. The engine never captures changes itself;
// it consumes sequence-numbered records through these interfaces.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// A row image: column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// One captured mutation. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Global sequence number, total across every relation.
    pub seq: u64,
    pub relation: String,
    pub op: RowOp,
    /// Primary key value rendered as text.
    pub key: String,
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub at: DateTime<Local>,
}

/// Ordered, append-only store of captured mutations.
///
/// Implementations must:
/// - keep records of a relation ordered by `seq`
/// - never rewrite a record
/// - only remove records through `purge`
pub trait ChangeLog: Send + Sync {
    /// Records of `relation` with `after < seq <= up_to`, ascending.
    fn records(&self, relation: &str, after: u64, up_to: u64) -> EngineResult<Vec<LogRecord>>;

    /// Number of records of `relation` with `after < seq <= up_to`.
    fn count(&self, relation: &str, after: u64, up_to: u64) -> EngineResult<u64> {
        Ok(self.records(relation, after, up_to)?.len() as u64)
    }

    /// Highest sequence number logged for `relation`, 0 when the log is empty.
    fn last_position(&self, relation: &str) -> EngineResult<u64>;

    /// Lowest and highest sequence numbers still stored for `relation`.
    fn bounds(&self, relation: &str) -> EngineResult<Option<(u64, u64)>>;

    /// Relations owning a log store.
    fn log_relations(&self) -> EngineResult<Vec<String>>;

    /// Remove the records of `relation` with `after < seq < before`.
    fn purge(&self, relation: &str, after: u64, before: u64) -> EngineResult<u64>;
}

/// The single monotonic counter ordering log records and marks.
pub trait GlobalSequence: Send + Sync {
    /// Take a fresh value. Values are never handed out twice.
    fn next(&self) -> EngineResult<u64>;

    /// Last value handed out.
    fn current(&self) -> EngineResult<u64>;
}
