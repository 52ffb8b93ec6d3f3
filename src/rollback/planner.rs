// Rollback Planner
//
// Turns (groups, target mark) into per-session batches. Cost is estimated
// per relation and relations are spread over sessions longest-first onto
// the least loaded session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{RollbackRequest, RollbackStatus};
use crate::config::catalog::{Catalog, GroupState, MarkRef, RelationKind, SequenceState};
use crate::config::settings::CostSettings;
use crate::drivers::Backend;
use crate::error::{EngineError, EngineResult};

/// Relation-level unit of rollback work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub relation_id: u32,
    pub relation: String,
    pub group: String,
    pub kind: RelationKind,
    /// Log rows to undo; 0 for sequences.
    pub rows: u64,
    pub cost_micros: u64,
    /// Value a sequence goes back to.
    #[serde(default)]
    pub restore_to: Option<SequenceState>,
}

/// Work assigned to one session. Items are in relation id order, which is
/// also the lock acquisition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlanBatch {
    pub request: u64,
    pub session: usize,
    pub items: Vec<WorkItem>,
    pub cost_micros: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostModel {
    pub per_row_micros: u64,
    pub per_table_micros: u64,
    pub per_sequence_micros: u64,
    pub logged_row_overhead_micros: u64,
    /// The per-row cost comes from measured history.
    pub calibrated: bool,
}

impl CostModel {
    pub fn from_settings(settings: &CostSettings, history: &[RollbackRequest]) -> Self {
        let mut model = Self {
            per_row_micros: settings.per_row_micros,
            per_table_micros: settings.per_table_micros,
            per_sequence_micros: settings.per_sequence_micros,
            logged_row_overhead_micros: settings.logged_row_overhead_micros,
            calibrated: false,
        };
        if !settings.calibrate_from_history {
            return model;
        }
        let (rows, elapsed) = history
            .iter()
            .filter(|r| r.status == RollbackStatus::Completed)
            .flat_map(|r| r.stats.iter())
            .filter(|s| s.kind == RelationKind::Table && s.rows > 0)
            .fold((0u64, 0u64), |(rows, elapsed), s| {
                (rows + s.rows, elapsed + s.elapsed_micros)
            });
        if rows > 0 {
            model.per_row_micros = (elapsed / rows).max(1);
            model.calibrated = true;
        }
        model
    }

    pub fn item_cost(&self, kind: RelationKind, rows: u64, logged: bool) -> u64 {
        match kind {
            RelationKind::Sequence => self.per_sequence_micros,
            RelationKind::Table => {
                let per_row = if logged {
                    self.per_row_micros + self.logged_row_overhead_micros
                } else {
                    self.per_row_micros
                };
                self.per_table_micros + rows.saturating_mul(per_row)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackPlan {
    pub groups: Vec<String>,
    /// Resolved name of the target mark.
    pub target_mark: String,
    pub target_seq: u64,
    pub logged: bool,
    pub requested_sessions: usize,
    pub batches: Vec<RollbackPlanBatch>,
    /// Tables with nothing to undo at planning time; they are not locked.
    pub idle_tables: Vec<String>,
    pub cost_model: CostModel,
}

impl RollbackPlan {
    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.batches.iter().flat_map(|b| b.items.iter())
    }

    pub fn table_count(&self) -> usize {
        self.items().filter(|i| i.kind == RelationKind::Table).count()
    }

    pub fn sequence_count(&self) -> usize {
        self.items().filter(|i| i.kind == RelationKind::Sequence).count()
    }

    pub fn rows(&self) -> u64 {
        self.items().map(|i| i.rows).sum()
    }

    pub fn total_cost(&self) -> u64 {
        self.batches.iter().map(|b| b.cost_micros).sum()
    }

    /// Cost of the most loaded session.
    pub fn makespan(&self) -> u64 {
        self.batches.iter().map(|b| b.cost_micros).max().unwrap_or(0)
    }

    pub fn with_request(mut self, request: u64) -> Self {
        for batch in &mut self.batches {
            batch.request = request;
        }
        self
    }
}

/// Advisory duration of a rollback: concurrent load is not accounted for.
#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub groups: Vec<String>,
    pub target_mark: String,
    pub logged: bool,
    pub sessions: usize,
    pub tables: usize,
    pub sequences: usize,
    pub rows: u64,
    pub total_micros: u64,
    pub estimated: Duration,
    pub calibrated: bool,
    pub advisory: bool,
}

impl From<&RollbackPlan> for CostEstimate {
    fn from(plan: &RollbackPlan) -> Self {
        Self {
            groups: plan.groups.clone(),
            target_mark: plan.target_mark.clone(),
            logged: plan.logged,
            sessions: plan.batches.len(),
            tables: plan.table_count(),
            sequences: plan.sequence_count(),
            rows: plan.rows(),
            total_micros: plan.total_cost(),
            estimated: Duration::from_micros(plan.makespan()),
            calibrated: plan.cost_model.calibrated,
            advisory: true,
        }
    }
}

/// Check the groups can be rolled back right now.
pub(crate) fn check_groups(catalog: &Catalog, groups: &[String]) -> EngineResult<()> {
    if groups.is_empty() {
        return Err(EngineError::EmptyGroup("(none)".into()));
    }
    for name in groups {
        let group = catalog.group(name)?;
        if group.state != GroupState::Logging {
            return Err(EngineError::InvalidState(format!(
                "group '{}' is not in LOGGING state",
                name
            )));
        }
        if let Some(req) = catalog
            .requests
            .iter()
            .find(|r| r.blocks_groups() && r.groups.contains(name))
        {
            return Err(EngineError::InvalidState(format!(
                "group '{}' is used by rollback request {} ({}); clean it up first",
                name,
                req.id,
                req.status.label()
            )));
        }
    }
    Ok(())
}

pub fn plan_rollback(
    catalog: &Catalog,
    backend: &dyn Backend,
    groups: &[String],
    target: &MarkRef,
    logged: bool,
    sessions: usize,
    cost: CostModel,
) -> EngineResult<RollbackPlan> {
    check_groups(catalog, groups)?;

    let relations: Vec<_> = groups.iter().flat_map(|g| catalog.relations_of(g)).collect();
    if relations.is_empty() {
        return Err(EngineError::EmptyGroup(groups.join(", ")));
    }

    let mut marks = Vec::with_capacity(groups.len());
    for group in groups {
        let mark = catalog
            .resolve_mark(group, target)
            .map_err(|_| EngineError::UnknownTarget {
                group: group.clone(),
                mark: target.to_string(),
            })?;
        marks.push(mark);
    }
    let target_seq = marks[0].global_seq;
    if marks.iter().any(|m| m.global_seq != target_seq) {
        return Err(EngineError::InvalidRange(format!(
            "mark '{}' does not designate the same point in time in every group",
            target
        )));
    }
    let head = backend.current()?;
    if target_seq > head {
        return Err(EngineError::InvalidRange(format!(
            "mark '{}' (global sequence {}) is beyond the log head {}",
            target, target_seq, head
        )));
    }
    for group in groups {
        if let Some(protected) = catalog
            .active_marks(group)
            .into_iter()
            .find(|m| m.protected && m.global_seq > target_seq)
        {
            return Err(EngineError::InvalidState(format!(
                "rollback to '{}' would cross protected mark '{}' of group '{}'",
                target, protected.name, group
            )));
        }
    }

    let mut items = Vec::new();
    let mut idle_tables = Vec::new();
    for rel in relations {
        let mark = marks
            .iter()
            .find(|m| m.group == rel.group)
            .ok_or_else(|| EngineError::Internal(format!("no target mark for '{}'", rel.group)))?;
        match rel.kind {
            RelationKind::Table => {
                if !mark.positions.contains_key(&rel.name) {
                    return Err(EngineError::InvalidRange(format!(
                        "table '{}' was not tracked when mark '{}' was set",
                        rel.name, mark.name
                    )));
                }
                let rows = backend.count(&rel.name, target_seq, u64::MAX)?;
                if rows == 0 {
                    idle_tables.push(rel.name.clone());
                    continue;
                }
                items.push(WorkItem {
                    relation_id: rel.id,
                    relation: rel.name.clone(),
                    group: rel.group.clone(),
                    kind: rel.kind,
                    rows,
                    cost_micros: cost.item_cost(rel.kind, rows, logged),
                    restore_to: None,
                });
            }
            RelationKind::Sequence => {
                let frozen = *mark.sequences.get(&rel.name).ok_or_else(|| {
                    EngineError::InvalidRange(format!(
                        "sequence '{}' was not tracked when mark '{}' was set",
                        rel.name, mark.name
                    ))
                })?;
                // Planned even when unchanged now: the value may still move
                // before the session takes its lock.
                items.push(WorkItem {
                    relation_id: rel.id,
                    relation: rel.name.clone(),
                    group: rel.group.clone(),
                    kind: rel.kind,
                    rows: 0,
                    cost_micros: cost.item_cost(rel.kind, 0, logged),
                    restore_to: Some(frozen),
                });
            }
        }
    }

    let requested_sessions = sessions.max(1);
    let sessions = requested_sessions.min(items.len()).max(1);
    let batches = assign_batches(items, sessions)
        .into_iter()
        .enumerate()
        .map(|(session, items)| RollbackPlanBatch {
            request: 0,
            session,
            cost_micros: items.iter().map(|i| i.cost_micros).sum(),
            items,
        })
        .collect();

    Ok(RollbackPlan {
        groups: groups.to_vec(),
        target_mark: marks[0].name.clone(),
        target_seq,
        logged,
        requested_sessions,
        batches,
        idle_tables,
        cost_model: cost,
    })
}

/// Longest-processing-time-first assignment: costliest item to the least
/// loaded session, then each session sorted by relation id.
pub fn assign_batches(mut items: Vec<WorkItem>, sessions: usize) -> Vec<Vec<WorkItem>> {
    let sessions = sessions.max(1);
    items.sort_by(|a, b| {
        b.cost_micros
            .cmp(&a.cost_micros)
            .then(a.relation_id.cmp(&b.relation_id))
    });
    let mut bins: Vec<(u64, Vec<WorkItem>)> = (0..sessions).map(|_| (0, Vec::new())).collect();
    for item in items {
        let lightest = bins
            .iter()
            .enumerate()
            .min_by_key(|(i, (load, _))| (*load, *i))
            .map(|(i, _)| i)
            .unwrap_or(0);
        bins[lightest].0 += item.cost_micros;
        bins[lightest].1.push(item);
    }
    bins.into_iter()
        .map(|(_, mut items)| {
            items.sort_by_key(|i| i.relation_id);
            items
        })
        .collect()
}
