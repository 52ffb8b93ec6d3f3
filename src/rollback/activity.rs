use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use super::{RollbackRequest, RollbackStatus};
use crate::drivers::LockOwner;
use crate::engine::Engine;
use crate::error::EngineResult;

/// Live view of a rollback request.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub request: u64,
    pub groups: Vec<String>,
    pub target_mark: String,
    pub logged: bool,
    pub sessions: usize,
    pub tables: usize,
    pub sequences: usize,
    pub status: RollbackStatus,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    /// Projection from the cost estimate; `None` once the request is over.
    pub remaining: Option<Duration>,
    pub completion_pct: f64,
}

impl ActivityRecord {
    fn of(request: &RollbackRequest, now: DateTime<Local>) -> Self {
        let elapsed = (now - request.started_at).to_std().unwrap_or_default();
        let remaining = (!request.status.is_terminal()).then(|| {
            Duration::from_micros(request.estimated_micros.saturating_sub(request.done_micros))
        });
        Self {
            request: request.id,
            groups: request.groups.clone(),
            target_mark: request.target_mark.clone(),
            logged: request.logged,
            sessions: request.sessions,
            tables: request.table_count,
            sequences: request.sequence_count,
            status: request.status,
            started_at: request.started_at,
            elapsed,
            remaining,
            completion_pct: request.completion_pct(),
        }
    }
}

impl Engine {
    /// Requests still in flight, plus failed ones awaiting cleanup.
    pub fn get_rollback_activity(&self) -> Vec<ActivityRecord> {
        let now = Local::now();
        self.catalog
            .requests
            .iter()
            .filter(|r| r.blocks_groups())
            .map(|r| ActivityRecord::of(r, now))
            .collect()
    }

    /// Purge the leftovers of failed and abandoned requests so their groups
    /// can be rolled back again. Returns the number of requests cleaned.
    #[tracing::instrument(skip(self), err)]
    pub fn cleanup_rollback_state(&mut self) -> EngineResult<usize> {
        let now = Local::now();
        let stale_after = self.settings.stale_after();
        let mut cleaned = 0;

        for index in 0..self.catalog.requests.len() {
            let request = &mut self.catalog.requests[index];
            if request.cleaned {
                continue;
            }
            if !request.status.is_terminal() {
                if now - request.last_activity <= stale_after {
                    continue;
                }
                tracing::warn!(
                    request = request.id,
                    status = request.status.label(),
                    "rollback request abandoned"
                );
                request.transition(RollbackStatus::Error);
                request.error = Some("abandoned: no activity since the last heartbeat".into());
            } else if request.status != RollbackStatus::Error {
                continue;
            }

            let id = request.id;
            for session in 0..request.sessions.max(1) {
                let owner = LockOwner {
                    request: id,
                    session,
                };
                let released = self.backend.release_locks(&owner)?;
                if released > 0 {
                    tracing::info!(%owner, released, "stale locks released");
                }
            }
            let request = &mut self.catalog.requests[index];
            request.plan.clear();
            request.session_records.clear();
            request.cleaned = true;
            cleaned += 1;
        }

        if cleaned > 0 {
            self.commit()?;
            tracing::info!(cleaned, "rollback state cleaned up");
        }
        Ok(cleaned)
    }
}
