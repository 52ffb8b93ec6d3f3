// Rollback Executor
//
// One thread per session. A session locks its tables in relation id order,
// waits for the coordinator's go, rewinds each relation as one unit and
// keeps its locks until the coordinator has finalized the request.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use super::CancelToken;
use super::planner::{RollbackPlanBatch, WorkItem};
use super::statement::InverseCommand;
use crate::config::catalog::RelationKind;
use crate::drivers::{Backend, LockOwner};
use crate::error::{EngineError, EngineResult};

/// Coordinator to session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// All sessions hold their locks: start rewinding.
    Go,
    /// Give up before touching anything.
    Abort,
    /// Bookkeeping is done: drop the locks.
    Release,
}

/// Session to coordinator.
#[derive(Debug)]
pub(crate) enum Report {
    Locked {
        session: usize,
    },
    LockFailed {
        session: usize,
        error: EngineError,
    },
    ItemDone(ItemReport),
    Finished {
        session: usize,
    },
    Stopped {
        session: usize,
    },
    Failed {
        session: usize,
        relation: String,
        error: EngineError,
    },
}

/// One relation rewound by a session.
#[derive(Debug)]
pub(crate) struct ItemReport {
    pub session: usize,
    pub relation: String,
    pub kind: RelationKind,
    pub rows: u64,
    pub cost_micros: u64,
    pub elapsed: Duration,
}

pub(crate) struct Session {
    pub owner: LockOwner,
    pub batch: RollbackPlanBatch,
    pub target_seq: u64,
    pub logged: bool,
    pub backend: Arc<dyn Backend>,
    pub lock_attempts: u32,
    pub lock_backoff: Duration,
    /// Set by the caller or by the coordinator after another session failed.
    pub stop: Vec<CancelToken>,
}

impl Session {
    pub(crate) fn run(self, commands: Receiver<Command>, reports: Sender<Report>) {
        let session = self.owner.session;

        if let Err(error) = self.lock_tables() {
            self.release();
            let _ = reports.send(Report::LockFailed { session, error });
            return;
        }
        let _ = reports.send(Report::Locked { session });

        if commands.recv() != Ok(Command::Go) {
            self.release();
            return;
        }

        for item in &self.batch.items {
            if self.stop.iter().any(CancelToken::is_cancelled) {
                tracing::info!(owner = %self.owner, "session stopped between relations");
                let _ = reports.send(Report::Stopped { session });
                self.wait_release(&commands);
                return;
            }
            let started = Instant::now();
            match self.rewind(item) {
                Ok(rows) => {
                    let _ = reports.send(Report::ItemDone(ItemReport {
                        session,
                        relation: item.relation.clone(),
                        kind: item.kind,
                        rows,
                        cost_micros: item.cost_micros,
                        elapsed: started.elapsed(),
                    }));
                }
                Err(error) => {
                    tracing::warn!(owner = %self.owner, relation = %item.relation, %error, "rewind failed");
                    let _ = reports.send(Report::Failed {
                        session,
                        relation: item.relation.clone(),
                        error,
                    });
                    self.wait_release(&commands);
                    return;
                }
            }
        }

        let _ = reports.send(Report::Finished { session });
        self.wait_release(&commands);
    }

    fn lock_tables(&self) -> EngineResult<()> {
        for item in self.batch.items.iter().filter(|i| i.kind == RelationKind::Table) {
            acquire_lock(
                self.backend.as_ref(),
                &item.relation,
                &self.owner,
                self.lock_attempts,
                self.lock_backoff,
            )?;
        }
        Ok(())
    }

    /// Undo one relation; returns the number of log rows unwound.
    fn rewind(&self, item: &WorkItem) -> EngineResult<u64> {
        match item.kind {
            RelationKind::Table => {
                let records = self
                    .backend
                    .records(&item.relation, self.target_seq, u64::MAX)?;
                let commands = InverseCommand::unwind(&records)?;
                self.backend
                    .apply(&item.relation, &commands, self.logged, &self.owner)?;
                tracing::debug!(owner = %self.owner, relation = %item.relation, rows = records.len(), "table rewound");
                Ok(records.len() as u64)
            }
            RelationKind::Sequence => {
                let state = item.restore_to.ok_or_else(|| {
                    EngineError::Internal(format!("no value planned for sequence '{}'", item.relation))
                })?;
                self.backend.restore_sequence(&item.relation, state)?;
                Ok(0)
            }
        }
    }

    fn wait_release(&self, commands: &Receiver<Command>) {
        // Any command or a dropped coordinator means the locks can go.
        let _ = commands.recv();
        self.release();
    }

    fn release(&self) {
        match self.backend.release_locks(&self.owner) {
            Ok(n) if n > 0 => tracing::debug!(owner = %self.owner, released = n, "locks released"),
            Ok(_) => {}
            Err(error) => tracing::error!(owner = %self.owner, %error, "cannot release locks"),
        }
    }
}

/// Try to lock `relation`, backing off between attempts. Running out of
/// attempts is fatal for the request.
pub(crate) fn acquire_lock(
    backend: &dyn Backend,
    relation: &str,
    owner: &LockOwner,
    attempts: u32,
    backoff: Duration,
) -> EngineResult<()> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match backend.try_lock(relation, owner) {
            Ok(()) => return Ok(()),
            Err(conflict) => {
                tracing::warn!(
                    %owner,
                    relation,
                    holder = %conflict.holder,
                    attempt,
                    "lock conflict"
                );
                if attempt < attempts {
                    thread::sleep(backoff * attempt);
                }
            }
        }
    }
    Err(EngineError::DeadlockExceeded {
        relation: relation.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::Database;
    use crate::drivers::memory::MemoryDatabase;

    #[test]
    fn retries_until_budget_is_spent() {
        let db = MemoryDatabase::new();
        db.create_table("t").unwrap();
        db.hold_lock("t", "backend 99").unwrap();
        let owner = LockOwner {
            request: 3,
            session: 0,
        };

        let started = Instant::now();
        let err = acquire_lock(&db, "t", &owner, 5, Duration::from_millis(2)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DeadlockExceeded { attempts: 5, .. }
        ));
        // 2 + 4 + 6 + 8 ms of backoff between the five attempts.
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(db.locks_of_request(3).unwrap().is_empty());
    }

    #[test]
    fn succeeds_once_the_holder_leaves() {
        let db = MemoryDatabase::new();
        db.create_table("t").unwrap();
        let owner = LockOwner {
            request: 3,
            session: 1,
        };
        acquire_lock(&db, "t", &owner, 5, Duration::from_millis(1)).unwrap();
        assert_eq!(db.locks_of_request(3).unwrap(), vec!["t".to_string()]);
    }
}
