// Mark Manager
//
// Marks freeze, for every relation of a group, the change log position and
// the sequence values at one point of the global sequence.

use std::collections::BTreeMap;

use chrono::{DateTime, Local, Timelike};
use serde::Serialize;

use crate::config::catalog::{
    GroupState, LAST_MARK, Mark, MarkRef, MarkState, RelationKind, SequenceState,
};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

/// Marks created by one `set_mark` call; all share one global sequence slot.
#[derive(Debug, Clone, Serialize)]
pub struct MarkSet {
    pub name: String,
    pub global_seq: u64,
    pub created_at: DateTime<Local>,
    pub ids: Vec<u64>,
}

/// Either a mark or a point in time.
#[derive(Debug, Clone)]
pub enum MarkPoint {
    Mark(MarkRef),
    Time(DateTime<Local>),
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkSummary {
    pub mark: Mark,
    /// Log rows recorded between this mark and the next one (or now).
    pub log_rows_before_next: u64,
}

/// Expand a `%` template into a time-based name. An absent or empty name is
/// the bare template.
pub fn resolve_mark_name(name: Option<&str>, at: &DateTime<Local>) -> String {
    let name = match name {
        Some(n) if !n.is_empty() => n,
        _ => "%",
    };
    if !name.contains('%') {
        return name.to_string();
    }
    let stamp = format!(
        "{}.{:02}",
        at.format("%H.%M.%S"),
        at.nanosecond() % 1_000_000_000 / 10_000_000
    );
    name.replace('%', &stamp)
}

impl Engine {
    /// Set a mark on one or several groups at once.
    ///
    /// With several groups, names of groups that do not exist are skipped
    /// with a warning; a single unknown group is an error.
    #[tracing::instrument(skip(self), err)]
    pub fn set_mark(&mut self, groups: &[&str], name: Option<&str>) -> EngineResult<MarkSet> {
        if name == Some(LAST_MARK) {
            return Err(EngineError::ReservedName(LAST_MARK.to_string()));
        }
        let mut selected: Vec<String> = Vec::new();
        for group in groups {
            if selected.iter().any(|g| g == group) {
                continue;
            }
            match self.catalog.group(group) {
                Ok(_) => selected.push(group.to_string()),
                Err(err) if groups.len() == 1 => return Err(err),
                Err(_) => tracing::warn!(group, "group does not exist, skipped"),
            }
        }
        if selected.is_empty() {
            return Err(EngineError::UnknownGroup(groups.join(", ")));
        }
        for group in &selected {
            if self.catalog.group(group)?.state != GroupState::Logging {
                return Err(EngineError::InvalidState(format!(
                    "group '{}' is not in LOGGING state",
                    group
                )));
            }
        }

        let created_at = self.next_mark_time();
        let mark_name = resolve_mark_name(name, &created_at);
        if mark_name == LAST_MARK {
            return Err(EngineError::ReservedName(LAST_MARK.to_string()));
        }
        let set = self.create_marks(&selected, &mark_name, created_at, None)?;
        self.commit()?;
        tracing::info!(mark = %set.name, global_seq = set.global_seq, "mark set");
        Ok(set)
    }

    /// Build and record one mark per group. Every fallible read happens
    /// before the catalog is touched, so either all groups get the mark or none.
    pub(crate) fn create_marks(
        &mut self,
        groups: &[String],
        name: &str,
        created_at: DateTime<Local>,
        logged_rollback_target: Option<&str>,
    ) -> EngineResult<MarkSet> {
        for group in groups {
            if self.find_active(group, name).is_some() {
                return Err(EngineError::MarkExists {
                    group: group.clone(),
                    mark: name.to_string(),
                });
            }
        }

        let global_seq = self.backend.next()?;
        let mut marks = Vec::with_capacity(groups.len());
        for group in groups {
            let previous_seq = self
                .catalog
                .active_marks(group)
                .last()
                .map(|m| m.global_seq)
                .unwrap_or(0);
            let mut positions = BTreeMap::new();
            let mut sequences = BTreeMap::new();
            let mut rows_since_previous = BTreeMap::new();
            for rel in self.catalog.relations_of(group) {
                match rel.kind {
                    RelationKind::Table => {
                        positions.insert(rel.name.clone(), self.backend.last_position(&rel.name)?);
                        rows_since_previous.insert(
                            rel.name.clone(),
                            self.backend.count(&rel.name, previous_seq, global_seq)?,
                        );
                    }
                    RelationKind::Sequence => {
                        sequences.insert(rel.name.clone(), self.backend.sequence_state(&rel.name)?);
                    }
                }
            }
            marks.push(Mark {
                id: 0,
                group: group.clone(),
                name: name.to_string(),
                created_at,
                global_seq,
                state: MarkState::Active,
                protected: false,
                comment: None,
                positions,
                sequences,
                rows_since_previous,
                logged_rollback_target: logged_rollback_target.map(str::to_string),
            });
        }

        let mut ids = Vec::with_capacity(marks.len());
        for mut mark in marks {
            mark.id = self.catalog.next_mark_id;
            self.catalog.next_mark_id += 1;
            ids.push(mark.id);
            self.catalog.marks.push(mark);
        }
        Ok(MarkSet {
            name: name.to_string(),
            global_seq,
            created_at,
            ids,
        })
    }

    /// Wall-clock time, nudged forward so mark timestamps never tie or go back.
    pub(crate) fn next_mark_time(&self) -> DateTime<Local> {
        let now = Local::now();
        match self.catalog.marks.iter().map(|m| m.created_at).max() {
            Some(latest) if latest >= now => latest + chrono::Duration::microseconds(1),
            _ => now,
        }
    }

    fn find_active(&self, group: &str, name: &str) -> Option<&Mark> {
        self.catalog
            .marks
            .iter()
            .find(|m| m.group == group && m.name == name && m.is_active())
    }

    #[tracing::instrument(skip(self), err)]
    pub fn rename_mark(&mut self, group: &str, mark: &MarkRef, new_name: &str) -> EngineResult<()> {
        if new_name == LAST_MARK {
            return Err(EngineError::ReservedName(LAST_MARK.to_string()));
        }
        if new_name.is_empty() {
            return Err(EngineError::InvalidName("a mark name cannot be empty".into()));
        }
        let id = self.catalog.resolve_mark(group, mark)?.id;
        if self.find_active(group, new_name).is_some() {
            return Err(EngineError::MarkExists {
                group: group.to_string(),
                mark: new_name.to_string(),
            });
        }
        self.catalog.mark_mut(id)?.name = new_name.to_string();
        self.commit()
    }

    #[tracing::instrument(skip(self, comment), err)]
    pub fn comment_mark(&mut self, group: &str, mark: &MarkRef, comment: Option<&str>) -> EngineResult<()> {
        let id = self.catalog.resolve_mark(group, mark)?.id;
        self.catalog.mark_mut(id)?.comment = comment.map(str::to_string);
        self.commit()
    }

    /// Forbid rollbacks to any mark older than this one.
    pub fn protect_mark(&mut self, group: &str, mark: &MarkRef) -> EngineResult<()> {
        let id = self.catalog.resolve_mark(group, mark)?.id;
        self.catalog.mark_mut(id)?.protected = true;
        self.commit()
    }

    pub fn unprotect_mark(&mut self, group: &str, mark: &MarkRef) -> EngineResult<()> {
        let id = self.catalog.resolve_mark(group, mark)?.id;
        self.catalog.mark_mut(id)?.protected = false;
        self.commit()
    }

    #[tracing::instrument(skip(self), err)]
    pub fn delete_mark(&mut self, group: &str, mark: &MarkRef) -> EngineResult<()> {
        let target = self.catalog.resolve_mark(group, mark)?;
        let (id, seq) = (target.id, target.global_seq);
        let carried = target.rows_since_previous.clone();
        let active = self.catalog.active_marks(group);
        if active.len() <= 1 {
            return Err(EngineError::InvalidState(format!(
                "at least one mark must remain in group '{}'",
                group
            )));
        }
        let was_first = active.first().map(|m| m.id) == Some(id);
        let next = active.iter().find(|m| m.global_seq > seq).map(|m| (m.id, m.global_seq));

        self.retire_mark(id)?;
        match next {
            Some((_, first_seq)) if was_first => {
                self.purge_log_before(group, first_seq)?;
            }
            // The next mark now starts where the deleted one's predecessor ends.
            Some((next_id, _)) => {
                let next = self.catalog.mark_mut(next_id)?;
                for (table, rows) in carried {
                    if let Some(count) = next.rows_since_previous.get_mut(&table) {
                        *count += rows;
                    }
                }
            }
            None => {}
        }
        self.commit()
    }

    /// Delete every mark older than `mark`; returns how many were deleted.
    #[tracing::instrument(skip(self), err)]
    pub fn delete_marks_before(&mut self, group: &str, mark: &MarkRef) -> EngineResult<usize> {
        let seq = self.catalog.resolve_mark(group, mark)?.global_seq;
        let older: Vec<u64> = self
            .catalog
            .active_marks(group)
            .iter()
            .filter(|m| m.global_seq < seq)
            .map(|m| m.id)
            .collect();
        for id in &older {
            self.retire_mark(*id)?;
        }
        self.purge_log_before(group, seq)?;
        self.commit()?;
        Ok(older.len())
    }

    /// Logical deletion; the sequence snapshot goes with it.
    pub(crate) fn retire_mark(&mut self, id: u64) -> EngineResult<()> {
        let mark = self.catalog.mark_mut(id)?;
        mark.state = MarkState::Deleted;
        mark.sequences.clear();
        tracing::debug!(group = %mark.group, mark = %mark.name, "mark deleted");
        Ok(())
    }

    fn purge_log_before(&mut self, group: &str, seq: u64) -> EngineResult<u64> {
        let mut purged = 0;
        for rel in self.catalog.relations_of(group) {
            if rel.kind == RelationKind::Table {
                purged += self.backend.purge(&rel.name, 0, seq)?;
            }
        }
        if purged > 0 {
            tracing::info!(group, purged, "log rows preceding the first mark purged");
        }
        Ok(purged)
    }

    /// Latest active mark strictly older than the given mark or time.
    pub fn previous_mark(&self, group: &str, point: &MarkPoint) -> EngineResult<Option<Mark>> {
        self.catalog.group(group)?;
        let active = self.catalog.active_marks(group);
        let previous = match point {
            MarkPoint::Mark(mark) => {
                let seq = self.catalog.resolve_mark(group, mark)?.global_seq;
                active.into_iter().filter(|m| m.global_seq < seq).last()
            }
            MarkPoint::Time(at) => active.into_iter().filter(|m| m.created_at < *at).last(),
        };
        Ok(previous.cloned())
    }

    pub fn list_marks(&self, group: &str) -> EngineResult<Vec<MarkSummary>> {
        self.catalog.group(group)?;
        let tables: Vec<String> = self
            .catalog
            .relations_of(group)
            .into_iter()
            .filter(|r| r.kind == RelationKind::Table)
            .map(|r| r.name.clone())
            .collect();
        let active = self.catalog.active_marks(group);
        let mut summaries = Vec::with_capacity(active.len());
        for (i, mark) in active.iter().enumerate() {
            let up_to = active.get(i + 1).map(|m| m.global_seq).unwrap_or(u64::MAX);
            let mut rows = 0;
            for table in &tables {
                rows += self.backend.count(table, mark.global_seq, up_to)?;
            }
            summaries.push(MarkSummary {
                mark: (*mark).clone(),
                log_rows_before_next: rows,
            });
        }
        Ok(summaries)
    }

    /// Sequence values frozen by `mark`.
    pub fn mark_sequences(&self, group: &str, mark: &MarkRef) -> EngineResult<BTreeMap<String, SequenceState>> {
        Ok(self.catalog.resolve_mark(group, mark)?.sequences.clone())
    }
}
