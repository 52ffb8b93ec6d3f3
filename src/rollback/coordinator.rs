// Rollback Coordinator
//
// Drives one request through PLANNING, LOCKING and EXECUTING. Sessions run
// on scoped threads and talk to the coordinator over channels; the
// coordinator alone writes the catalog.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Instant;

use chrono::Local;

use super::executor::{Command, ItemReport, Report, Session};
use super::planner::{CostModel, RollbackPlan, plan_rollback};
use super::statement::{InverseCommand, sequence_reset_sql};
use super::{
    CancelToken, CostEstimate, RelationStat, RollbackOptions, RollbackOutcome, RollbackProgress,
    RollbackRequest, RollbackStatus, SessionRecord, SessionStatus,
};
use crate::config::catalog::{MarkRef, RelationKind};
use crate::drivers::LockOwner;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::storage::write_atomically;

fn dedup(groups: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(groups.len());
    for group in groups {
        if !out.iter().any(|g| g == group) {
            out.push(group.to_string());
        }
    }
    out
}

fn broadcast(commands: &[Sender<Command>], command: Command) {
    for tx in commands {
        // A session that already gave up has dropped its receiver.
        let _ = tx.send(command);
    }
}

impl Engine {
    fn cost_model(&self) -> CostModel {
        CostModel::from_settings(&self.settings.cost, &self.catalog.requests)
    }

    fn plan(
        &self,
        groups: &[String],
        target: &MarkRef,
        logged: bool,
        sessions: Option<usize>,
    ) -> EngineResult<RollbackPlan> {
        plan_rollback(
            &self.catalog,
            self.backend.as_ref(),
            groups,
            target,
            logged,
            sessions.unwrap_or(self.settings.default_sessions),
            self.cost_model(),
        )
    }

    /// Advisory cost of rolling `groups` back to `target`. Nothing is locked
    /// or recorded.
    pub fn estimate_rollback(
        &self,
        groups: &[&str],
        target: &MarkRef,
        logged: bool,
        sessions: Option<usize>,
    ) -> EngineResult<CostEstimate> {
        let plan = self.plan(&dedup(groups), target, logged, sessions)?;
        Ok(CostEstimate::from(&plan))
    }

    /// Write the statements a rollback to `target` would apply, instead of
    /// applying them. Returns the number of statements written.
    #[tracing::instrument(skip(self), err)]
    pub fn export_rollback_script(
        &self,
        groups: &[&str],
        target: &MarkRef,
        path: &Path,
    ) -> EngineResult<usize> {
        let plan = self.plan(&dedup(groups), target, false, None)?;
        let mut lines = vec![
            format!(
                "-- rollback of {} to mark '{}' (global sequence {})",
                plan.groups.join(", "),
                plan.target_mark,
                plan.target_seq
            ),
            "BEGIN;".to_string(),
        ];
        let mut statements = 0;
        let mut resets = Vec::new();
        for batch in &plan.batches {
            lines.push(format!("-- session {}", batch.session));
            for item in &batch.items {
                match item.kind {
                    RelationKind::Table => {
                        let key_column = self
                            .catalog
                            .relations
                            .iter()
                            .find(|r| r.name == item.relation)
                            .map(|r| r.key_column.as_str())
                            .unwrap_or("id");
                        let records = self.backend.records(&item.relation, plan.target_seq, u64::MAX)?;
                        for command in InverseCommand::unwind(&records)? {
                            lines.push(command.to_sql(&item.relation, key_column));
                            statements += 1;
                        }
                    }
                    RelationKind::Sequence => {
                        if let Some(state) = &item.restore_to {
                            resets.push(sequence_reset_sql(&item.relation, state));
                        }
                    }
                }
            }
        }
        if !resets.is_empty() {
            lines.push("-- sequences".to_string());
            statements += resets.len();
            lines.extend(resets);
        }
        lines.push("COMMIT;".to_string());
        write_atomically(path, &(lines.join("\n") + "\n"))?;
        tracing::info!(statements, path = %path.display(), "rollback script written");
        Ok(statements)
    }

    /// Roll `groups` back to `target`.
    ///
    /// Errors raised while planning leave no trace. Once planned, the request
    /// is recorded and always ends COMPLETED, ABORTED (nothing touched) or
    /// ERROR (some relations may already be rewound).
    #[tracing::instrument(skip(self, options), err)]
    pub fn rollback(
        &mut self,
        groups: &[&str],
        target: &MarkRef,
        logged: bool,
        mut options: RollbackOptions,
    ) -> EngineResult<RollbackOutcome> {
        let started = Instant::now();
        let plan = self.plan(&dedup(groups), target, logged, options.sessions)?;

        let id = self.catalog.next_request_id;
        self.catalog.next_request_id += 1;
        let plan = plan.with_request(id);
        let request = self.new_request(id, &plan);
        self.catalog.requests.push(request);
        tracing::info!(
            request = id,
            target = %plan.target_mark,
            sessions = plan.batches.len(),
            tables = plan.table_count(),
            sequences = plan.sequence_count(),
            "rollback planned"
        );
        if let Err(err) = self.enter_locking(id, &mut options) {
            self.close_request(id, RollbackStatus::Aborted, Some(&err));
            return Err(err);
        }

        let stop = CancelToken::new();
        let backend = self.backend.clone();
        let lock_attempts = self.settings.lock_attempts;
        let lock_backoff = self.settings.lock_backoff(1);

        let result = thread::scope(|scope| {
            let (report_tx, reports) = mpsc::channel();
            let mut commands = Vec::with_capacity(plan.batches.len());
            for batch in &plan.batches {
                let (tx, rx) = mpsc::channel();
                let session = Session {
                    owner: LockOwner {
                        request: id,
                        session: batch.session,
                    },
                    batch: batch.clone(),
                    target_seq: plan.target_seq,
                    logged,
                    backend: backend.clone(),
                    lock_attempts,
                    lock_backoff,
                    stop: vec![options.cancel.clone(), stop.clone()],
                };
                let report_tx = report_tx.clone();
                scope.spawn(move || session.run(rx, report_tx));
                commands.push(tx);
            }
            drop(report_tx);
            // Dropping `commands` on return unblocks any session still waiting.
            self.drive(id, &plan, &commands, &reports, &mut options, &stop)
        });

        let mut outcome = result?;
        outcome.elapsed = started.elapsed();
        tracing::info!(
            request = id,
            rows = outcome.unwound_rows,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "rollback completed"
        );
        Ok(outcome)
    }

    /// Persist the new request and move it to LOCKING unless cancelled.
    fn enter_locking(&mut self, id: u64, options: &mut RollbackOptions) -> EngineResult<()> {
        self.commit()?;
        self.notify(id, None, options)?;
        if options.cancel.is_cancelled() {
            return Err(EngineError::Cancelled(id));
        }
        self.catalog.request_mut(id)?.transition(RollbackStatus::Locking);
        self.commit()?;
        self.notify(id, None, options)
    }

    fn new_request(&self, id: u64, plan: &RollbackPlan) -> RollbackRequest {
        let now = Local::now();
        let mut request = RollbackRequest {
            id,
            groups: plan.groups.clone(),
            target_mark: plan.target_mark.clone(),
            target_seq: plan.target_seq,
            logged: plan.logged,
            requested_sessions: plan.requested_sessions,
            sessions: plan.batches.len(),
            status: RollbackStatus::Planning,
            transitions: Vec::new(),
            started_at: now,
            last_activity: now,
            table_count: plan.table_count(),
            sequence_count: plan.sequence_count(),
            estimated_micros: plan.makespan(),
            done_micros: 0,
            unwound_rows: 0,
            start_mark: None,
            start_seq: None,
            done_mark: None,
            done_seq: None,
            error: None,
            cleaned: false,
            consolidated: false,
            plan: plan.batches.clone(),
            session_records: plan
                .batches
                .iter()
                .map(|b| SessionRecord {
                    session: b.session,
                    status: SessionStatus::Pending,
                    completed_items: 0,
                    done_micros: 0,
                })
                .collect(),
            stats: Vec::new(),
        };
        request.transition(RollbackStatus::Planning);
        request
    }

    /// Lock, execute and finalize. Runs while the sessions are alive.
    fn drive(
        &mut self,
        id: u64,
        plan: &RollbackPlan,
        commands: &[Sender<Command>],
        reports: &Receiver<Report>,
        options: &mut RollbackOptions,
        stop: &CancelToken,
    ) -> EngineResult<RollbackOutcome> {
        // Lock phase: every session reports once.
        let mut lock_failure = None;
        for _ in 0..commands.len() {
            match reports.recv() {
                Ok(Report::Locked { session }) => {
                    self.set_session_status(id, session, SessionStatus::Locked);
                }
                Ok(Report::LockFailed { session, error }) => {
                    tracing::warn!(request = id, session, %error, "session could not lock its tables");
                    self.set_session_status(id, session, SessionStatus::Failed);
                    lock_failure.get_or_insert(error);
                }
                Ok(other) => {
                    return Err(self.abandon(
                        id,
                        commands,
                        EngineError::Internal(format!("unexpected report while locking: {:?}", other)),
                    ));
                }
                Err(_) => {
                    return Err(self.abandon(
                        id,
                        commands,
                        EngineError::Internal("a session ended while locking".into()),
                    ));
                }
            }
        }
        if let Some(error) = lock_failure {
            broadcast(commands, Command::Abort);
            self.close_request(id, RollbackStatus::Error, Some(&error));
            return Err(error);
        }

        if options.cancel.is_cancelled() {
            broadcast(commands, Command::Abort);
            let err = EngineError::Cancelled(id);
            self.close_request(id, RollbackStatus::Aborted, Some(&err));
            return Err(err);
        }
        if let Err(err) = self.check_idle_tables(plan) {
            broadcast(commands, Command::Abort);
            self.close_request(id, RollbackStatus::Aborted, Some(&err));
            return Err(err);
        }

        // Nothing has been touched up to here.
        let stamp = self.rollback_mark_stamp(id, plan);
        if let Err(err) = self.enter_executing(id, plan, &stamp, options) {
            broadcast(commands, Command::Abort);
            self.close_request(id, RollbackStatus::Aborted, Some(&err));
            return Err(err);
        }
        broadcast(commands, Command::Go);

        let mut failure: Option<EngineError> = None;
        let mut stopped = false;
        let mut running = commands.len();
        while running > 0 {
            let report = match reports.recv() {
                Ok(report) => report,
                Err(_) => {
                    failure.get_or_insert(EngineError::Internal(
                        "a session ended without reporting".into(),
                    ));
                    break;
                }
            };
            let recorded = match report {
                Report::ItemDone(item) => self.record_item(id, item, options),
                Report::Finished { session } => {
                    running -= 1;
                    self.set_session_status(id, session, SessionStatus::Done);
                    Ok(())
                }
                Report::Stopped { session } => {
                    running -= 1;
                    stopped = true;
                    self.set_session_status(id, session, SessionStatus::Failed);
                    Ok(())
                }
                Report::Failed {
                    session,
                    relation,
                    error,
                } => {
                    tracing::warn!(request = id, session, %relation, "session failed");
                    running -= 1;
                    self.set_session_status(id, session, SessionStatus::Failed);
                    Err(error)
                }
                Report::Locked { .. } | Report::LockFailed { .. } => Ok(()),
            };
            if let Err(error) = recorded {
                tracing::error!(request = id, %error, "rollback cannot go on");
                // The other sessions stop before their next relation.
                stop.cancel();
                failure.get_or_insert(error);
            }
        }

        if let Some(error) = failure {
            self.close_request(id, RollbackStatus::Error, Some(&error));
            broadcast(commands, Command::Release);
            return Err(error);
        }
        if stopped {
            let err = EngineError::Cancelled(id);
            self.close_request(id, RollbackStatus::Error, Some(&err));
            broadcast(commands, Command::Release);
            return Err(err);
        }

        // Bookkeeping happens while the tables are still locked.
        let finalized = self.finalize(id, plan, &stamp);
        broadcast(commands, Command::Release);
        if let Err(err) = finalized {
            self.close_request(id, RollbackStatus::Error, Some(&err));
            return Err(err);
        }
        self.notify(id, None, options)?;

        let request = self.catalog.request(id)?;
        Ok(RollbackOutcome {
            request: id,
            status: request.status,
            sessions: request.sessions,
            tables: request.table_count,
            sequences: request.sequence_count,
            unwound_rows: request.unwound_rows,
            start_mark: request.start_mark.clone(),
            done_mark: request.done_mark.clone(),
            elapsed: Default::default(),
        })
    }

    fn check_idle_tables(&self, plan: &RollbackPlan) -> EngineResult<()> {
        for table in &plan.idle_tables {
            if self.backend.count(table, plan.target_seq, u64::MAX)? > 0 {
                return Err(EngineError::InvalidState(format!(
                    "table '{}' changed while the rollback was being planned",
                    table
                )));
            }
        }
        Ok(())
    }

    /// Set the START marks of a logged rollback and move to EXECUTING.
    fn enter_executing(
        &mut self,
        id: u64,
        plan: &RollbackPlan,
        stamp: &str,
        options: &mut RollbackOptions,
    ) -> EngineResult<()> {
        if plan.logged {
            let name = format!("RLBK_{}_{}_START", plan.target_mark, stamp);
            let at = self.next_mark_time();
            let set = self.create_marks(&plan.groups, &name, at, Some(&plan.target_mark))?;
            let request = self.catalog.request_mut(id)?;
            request.start_mark = Some(set.name);
            request.start_seq = Some(set.global_seq);
        }
        let request = self.catalog.request_mut(id)?;
        request.transition(RollbackStatus::Executing);
        for record in &mut request.session_records {
            record.status = SessionStatus::Executing;
        }
        self.commit()?;
        self.notify(id, None, options)
    }

    fn record_item(&mut self, id: u64, item: ItemReport, options: &mut RollbackOptions) -> EngineResult<()> {
        let request = self.catalog.request_mut(id)?;
        request.done_micros += item.cost_micros;
        request.unwound_rows += item.rows;
        request.stats.push(RelationStat {
            relation: item.relation.clone(),
            kind: item.kind,
            rows: item.rows,
            elapsed_micros: item.elapsed.as_micros() as u64,
        });
        if let Some(record) = request
            .session_records
            .iter_mut()
            .find(|r| r.session == item.session)
        {
            record.completed_items += 1;
            record.done_micros += item.cost_micros;
        }
        request.heartbeat();
        self.commit()?;
        self.notify(id, Some(item.relation), options)
    }

    fn finalize(&mut self, id: u64, plan: &RollbackPlan, stamp: &str) -> EngineResult<()> {
        if plan.logged {
            let name = format!("RLBK_{}_{}_DONE", plan.target_mark, stamp);
            let at = self.next_mark_time();
            let set = self.create_marks(&plan.groups, &name, at, None)?;
            let request = self.catalog.request_mut(id)?;
            request.done_mark = Some(set.name);
            request.done_seq = Some(set.global_seq);
        } else {
            let mut purged = 0;
            for item in plan.items().filter(|i| i.kind == RelationKind::Table) {
                purged += self.backend.purge(&item.relation, plan.target_seq, u64::MAX)?;
            }
            let newer: Vec<u64> = plan
                .groups
                .iter()
                .flat_map(|g| self.catalog.active_marks(g))
                .filter(|m| m.global_seq > plan.target_seq)
                .map(|m| m.id)
                .collect();
            for mark in &newer {
                self.retire_mark(*mark)?;
            }
            tracing::info!(request = id, purged, marks_deleted = newer.len(), "unlogged rollback finalized");
        }
        self.catalog.request_mut(id)?.transition(RollbackStatus::Completed);
        self.commit()
    }

    /// Time stamp shared by the START and DONE marks of a logged rollback.
    fn rollback_mark_stamp(&self, id: u64, plan: &RollbackPlan) -> String {
        let stamp = Local::now().format("%H.%M.%S%.3f").to_string();
        let prefix = format!("RLBK_{}_{}_", plan.target_mark, stamp);
        let taken = plan.groups.iter().any(|g| {
            self.catalog
                .active_marks(g)
                .iter()
                .any(|m| m.name.starts_with(&prefix))
        });
        if taken { format!("{}.{}", stamp, id) } else { stamp }
    }

    fn set_session_status(&mut self, id: u64, session: usize, status: SessionStatus) {
        match self.catalog.request_mut(id) {
            Ok(request) => {
                if let Some(record) = request.session_records.iter_mut().find(|r| r.session == session) {
                    record.status = status;
                }
                request.heartbeat();
            }
            Err(err) => tracing::error!(request = id, session, %err, "cannot record session status"),
        }
    }

    /// Move the request to a terminal state. A failure to persist it is
    /// logged: the caller is already returning the error that matters.
    fn close_request(&mut self, id: u64, status: RollbackStatus, error: Option<&EngineError>) {
        match self.catalog.request_mut(id) {
            Ok(request) => {
                request.transition(status);
                request.error = error.map(|e| e.to_string());
            }
            Err(err) => {
                tracing::error!(request = id, %err, "cannot close rollback request");
                return;
            }
        }
        tracing::warn!(request = id, status = status.label(), "rollback request closed");
        if let Err(err) = self.commit() {
            tracing::error!(request = id, %err, "cannot persist rollback request state");
        }
    }

    fn abandon(&mut self, id: u64, commands: &[Sender<Command>], error: EngineError) -> EngineError {
        broadcast(commands, Command::Abort);
        self.close_request(id, RollbackStatus::Error, Some(&error));
        error
    }

    fn notify(
        &self,
        id: u64,
        relation: Option<String>,
        options: &mut RollbackOptions,
    ) -> EngineResult<()> {
        if let Some(progress) = options.progress.as_mut() {
            let request = self.catalog.request(id)?;
            progress(&RollbackProgress {
                request: id,
                status: request.status,
                relation,
                done_micros: request.done_micros,
                estimated_micros: request.estimated_micros,
            });
        }
        Ok(())
    }
}
