// Rollback Engine
//
// A rollback request walks PLANNING -> LOCKING -> EXECUTING and ends in
// COMPLETED, ERROR or ABORTED. ABORTED is only reachable before any table
// has been touched.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::catalog::RelationKind;

pub mod activity;
pub mod coordinator;
pub mod executor;
pub mod planner;
pub mod statement;

pub use planner::{CostEstimate, RollbackPlan, RollbackPlanBatch, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackStatus {
    Planning,
    Locking,
    Executing,
    Completed,
    Error,
    Aborted,
}

impl RollbackStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RollbackStatus::Completed | RollbackStatus::Error | RollbackStatus::Aborted
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            RollbackStatus::Planning => "PLANNING",
            RollbackStatus::Locking => "LOCKING",
            RollbackStatus::Executing => "EXECUTING",
            RollbackStatus::Completed => "COMPLETED",
            RollbackStatus::Error => "ERROR",
            RollbackStatus::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub status: RollbackStatus,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Locked,
    Executing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: usize,
    pub status: SessionStatus,
    pub completed_items: usize,
    pub done_micros: u64,
}

/// Measured cost of one relation, kept as calibration history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationStat {
    pub relation: String,
    pub kind: RelationKind,
    pub rows: u64,
    pub elapsed_micros: u64,
}

/// One rollback attempt. Never removed: terminal requests are history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub id: u64,
    pub groups: Vec<String>,
    pub target_mark: String,
    pub target_seq: u64,
    pub logged: bool,
    pub requested_sessions: usize,
    pub sessions: usize,
    pub status: RollbackStatus,
    pub transitions: Vec<Transition>,
    pub started_at: DateTime<Local>,
    /// Heartbeat: refreshed on every transition and progress report.
    pub last_activity: DateTime<Local>,
    pub table_count: usize,
    pub sequence_count: usize,
    pub estimated_micros: u64,
    pub done_micros: u64,
    pub unwound_rows: u64,
    #[serde(default)]
    pub start_mark: Option<String>,
    #[serde(default)]
    pub start_seq: Option<u64>,
    #[serde(default)]
    pub done_mark: Option<String>,
    #[serde(default)]
    pub done_seq: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cleaned: bool,
    #[serde(default)]
    pub consolidated: bool,
    #[serde(default)]
    pub plan: Vec<RollbackPlanBatch>,
    #[serde(default)]
    pub session_records: Vec<SessionRecord>,
    #[serde(default)]
    pub stats: Vec<RelationStat>,
}

impl RollbackRequest {
    pub(crate) fn transition(&mut self, status: RollbackStatus) {
        let now = Local::now();
        self.status = status;
        self.transitions.push(Transition { status, at: now });
        self.last_activity = now;
    }

    pub(crate) fn heartbeat(&mut self) {
        self.last_activity = Local::now();
    }

    pub fn entered_at(&self, status: RollbackStatus) -> Option<DateTime<Local>> {
        self.transitions
            .iter()
            .find(|t| t.status == status)
            .map(|t| t.at)
    }

    /// Whether the request still prevents new rollbacks on its groups.
    pub fn blocks_groups(&self) -> bool {
        !self.status.is_terminal() || (self.status == RollbackStatus::Error && !self.cleaned)
    }

    pub fn completion_pct(&self) -> f64 {
        match self.status {
            RollbackStatus::Completed => 100.0,
            _ if self.estimated_micros == 0 => 0.0,
            _ => (self.done_micros as f64 / self.estimated_micros as f64 * 100.0).min(99.9),
        }
    }
}

/// Cooperative stop request, checked by sessions between relations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress report handed to `RollbackOptions::progress`.
#[derive(Debug, Clone)]
pub struct RollbackProgress {
    pub request: u64,
    pub status: RollbackStatus,
    pub relation: Option<String>,
    pub done_micros: u64,
    pub estimated_micros: u64,
}

#[derive(Default)]
pub struct RollbackOptions {
    /// Worker sessions; the configured default when `None`.
    pub sessions: Option<usize>,
    pub cancel: CancelToken,
    pub progress: Option<Box<dyn FnMut(&RollbackProgress)>>,
}

impl RollbackOptions {
    pub fn with_sessions(sessions: usize) -> Self {
        Self {
            sessions: Some(sessions),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub request: u64,
    pub status: RollbackStatus,
    pub sessions: usize,
    pub tables: usize,
    pub sequences: usize,
    pub unwound_rows: u64,
    pub start_mark: Option<String>,
    pub done_mark: Option<String>,
    pub elapsed: Duration,
}
