// Consolidator
//
// A chain is a run of completed logged rollbacks of one group to the same
// mark T, each starting right where the previous one ended: no change was
// logged for the group between a DONE mark and the next START mark. The
// data at the last DONE mark equals the data at T, so everything logged in
// between can go.

use serde::Serialize;

use crate::config::catalog::{MarkRef, RelationKind};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::rollback::{RollbackRequest, RollbackStatus};

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    pub group: String,
    pub target_mark: String,
    /// Requests merged, oldest first.
    pub requests: Vec<u64>,
    /// Mark closing the collapsed range.
    pub end_mark: String,
    pub marks_deleted: usize,
    /// Rows the chained rollbacks undid, summed over the chain.
    pub reclaimed_rows: u64,
    /// Log records deleted: the undone changes and their compensating records.
    pub purged_records: u64,
}

impl Engine {
    /// Collapse the chain of logged rollbacks to `start_mark` on `group`.
    #[tracing::instrument(skip(self), err)]
    pub fn consolidate_rollback(
        &mut self,
        group: &str,
        start_mark: &MarkRef,
    ) -> EngineResult<ConsolidationReport> {
        let logging_since = self.catalog.group(group)?.logging_since;
        let target = self.catalog.resolve_mark(group, start_mark)?;
        let (target_name, target_seq) = (target.name.clone(), target.global_seq);
        if logging_since > target_seq {
            return Err(EngineError::InvalidChain(format!(
                "group '{}' restarted logging after mark '{}'",
                group, target_name
            )));
        }

        let mut history: Vec<&RollbackRequest> = self
            .catalog
            .requests
            .iter()
            .filter(|r| r.groups.iter().any(|g| g == group))
            .filter(|r| r.status != RollbackStatus::Aborted)
            .collect();
        history.sort_by_key(|r| r.id);

        let first = history
            .iter()
            .position(|r| chains_to(r, &target_name, target_seq) && !r.consolidated)
            .ok_or_else(|| {
                EngineError::InvalidChain(format!(
                    "no completed logged rollback of group '{}' to mark '{}'",
                    group, target_name
                ))
            })?;

        let tables: Vec<String> = self
            .catalog
            .relations_of(group)
            .into_iter()
            .filter(|r| r.kind == RelationKind::Table)
            .map(|r| r.name.clone())
            .collect();

        let mut chain = vec![history[first]];
        for next in &history[first + 1..] {
            let last = chain[chain.len() - 1];
            let done_seq = last.done_seq.ok_or_else(|| {
                EngineError::Internal(format!("rollback request {} has no DONE mark", last.id))
            })?;
            if !self.contiguous(&tables, done_seq, next)? {
                break;
            }
            if !chains_to(next, &target_name, target_seq) {
                return Err(EngineError::InvalidChain(format!(
                    "rollback request {} ({}{}) follows request {} directly",
                    next.id,
                    if next.logged { "logged, " } else { "unlogged, " },
                    next.status.label(),
                    last.id
                )));
            }
            chain.push(next);
        }

        let last = chain[chain.len() - 1];
        let end_seq = last.done_seq.ok_or_else(|| {
            EngineError::Internal(format!("rollback request {} has no DONE mark", last.id))
        })?;
        let end_mark = last.done_mark.clone().unwrap_or_default();
        let ids: Vec<u64> = chain.iter().map(|r| r.id).collect();
        let reclaimed_rows: u64 = chain.iter().map(|r| r.unwound_rows).sum();

        let mut purged_records = 0;
        for table in &tables {
            purged_records += self.backend.purge(table, target_seq, end_seq)?;
        }
        let between: Vec<u64> = self
            .catalog
            .active_marks(group)
            .into_iter()
            .filter(|m| m.global_seq > target_seq && m.global_seq < end_seq)
            .map(|m| m.id)
            .collect();
        for id in &between {
            self.retire_mark(*id)?;
        }
        let end_id = self
            .catalog
            .active_marks(group)
            .into_iter()
            .find(|m| m.global_seq == end_seq)
            .map(|m| m.id);
        if let Some(end_id) = end_id {
            // Nothing is left between the target and the end mark.
            for rows in self.catalog.mark_mut(end_id)?.rows_since_previous.values_mut() {
                *rows = 0;
            }
        }
        for id in &ids {
            self.catalog.request_mut(*id)?.consolidated = true;
        }
        self.commit()?;

        tracing::info!(
            group,
            requests = ids.len(),
            marks_deleted = between.len(),
            reclaimed_rows,
            purged_records,
            "rollbacks consolidated"
        );
        Ok(ConsolidationReport {
            group: group.to_string(),
            target_mark: target_name,
            requests: ids,
            end_mark,
            marks_deleted: between.len(),
            reclaimed_rows,
            purged_records,
        })
    }

    /// No change was logged for `tables` between `done_seq` and the start of `next`.
    fn contiguous(&self, tables: &[String], done_seq: u64, next: &RollbackRequest) -> EngineResult<bool> {
        for table in tables {
            let forward = match next.start_seq {
                Some(start) => self.backend.count(table, done_seq, start.saturating_sub(1))?,
                None => self
                    .backend
                    .records(table, done_seq, u64::MAX)?
                    .iter()
                    .filter(|r| r.at < next.started_at)
                    .count() as u64,
            };
            if forward > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn chains_to(request: &RollbackRequest, target_name: &str, target_seq: u64) -> bool {
    request.status == RollbackStatus::Completed
        && request.logged
        && request.target_mark == target_name
        && request.target_seq == target_seq
        && request.done_seq.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeLog;
    use crate::rollback::RollbackOptions;
    use crate::test_support::{fixture, row};
    use serde_json::json;

    #[test]
    fn consecutive_logged_rollbacks_collapse_into_one_range() {
        let (mut engine, db) = fixture();
        db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();
        engine.set_mark(&["myGroup1"], Some("M1")).unwrap();
        db.insert("public.orders", "2", row(json!({"id": 2}))).unwrap();
        db.update("public.orders", "1", row(json!({"id": 1, "x": 1}))).unwrap();
        let first = engine
            .rollback(&["myGroup1"], &"M1".into(), true, RollbackOptions::default())
            .unwrap();
        let second = engine
            .rollback(&["myGroup1"], &"M1".into(), true, RollbackOptions::default())
            .unwrap();
        // The forward changes and the compensations of the first rollback.
        assert_eq!(second.unwound_rows, 4);

        let report = engine.consolidate_rollback("myGroup1", &"M1".into()).unwrap();

        assert_eq!(report.requests, vec![first.request, second.request]);
        assert_eq!(report.reclaimed_rows, first.unwound_rows + second.unwound_rows);
        assert_eq!(report.reclaimed_rows, 6);
        assert_eq!(report.purged_records, 8);
        assert_eq!(report.end_mark, second.done_mark.unwrap());
        let names: Vec<String> = engine
            .catalog()
            .active_marks("myGroup1")
            .iter()
            .map(|m| m.name.clone())
            .collect();
        assert_eq!(names, vec!["M1".to_string(), report.end_mark.clone()]);
        assert_eq!(db.count("public.orders", 0, u64::MAX).unwrap(), 1);
        assert!(engine.verify_all().unwrap().is_empty());

        let err = engine.consolidate_rollback("myGroup1", &"M1".into()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidChain(_)));
    }

    #[test]
    fn forward_changes_end_the_chain() {
        let (mut engine, db) = fixture();
        engine.set_mark(&["myGroup1"], Some("M1")).unwrap();
        db.insert("public.orders", "1", row(json!({"id": 1}))).unwrap();
        let first = engine
            .rollback(&["myGroup1"], &"M1".into(), true, RollbackOptions::default())
            .unwrap();
        db.insert("public.orders", "2", row(json!({"id": 2}))).unwrap();
        engine
            .rollback(&["myGroup1"], &"M1".into(), true, RollbackOptions::default())
            .unwrap();

        let report = engine.consolidate_rollback("myGroup1", &"M1".into()).unwrap();
        assert_eq!(report.requests, vec![first.request]);
        assert_eq!(report.reclaimed_rows, first.unwound_rows);
        assert_eq!(report.reclaimed_rows, 1);
        assert_eq!(report.purged_records, 2);
    }

    #[test]
    fn unlogged_rollback_breaks_the_chain() {
        let (mut engine, _db) = fixture();
        engine.set_mark(&["myGroup1"], Some("M1")).unwrap();
        engine.set_mark(&["myGroup1"], Some("M2")).unwrap();
        engine
            .rollback(&["myGroup1"], &"M1".into(), true, RollbackOptions::default())
            .unwrap();
        engine
            .rollback(&["myGroup1"], &"M1".into(), false, RollbackOptions::default())
            .unwrap();

        let err = engine.consolidate_rollback("myGroup1", &"M1".into()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidChain(_)));
    }
}
