use serde::Serialize;

use crate::config::catalog::{MarkRef, RelationKind};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

/// Log rows of one table between two marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogStat {
    pub relation: String,
    /// `None` means the start of the log.
    pub from_mark: Option<String>,
    /// `None` means now.
    pub to_mark: Option<String>,
    pub rows: u64,
}

impl Engine {
    /// Per-table log row counts of `group` between `from` (default: the
    /// oldest active mark) and `to` (default: now).
    pub fn log_stat(
        &self,
        group: &str,
        from: Option<&MarkRef>,
        to: Option<&MarkRef>,
    ) -> EngineResult<Vec<LogStat>> {
        self.catalog.group(group)?;
        let (from_mark, after) = match from {
            Some(mark) => {
                let m = self.catalog.resolve_mark(group, mark)?;
                (Some(m.name.clone()), m.global_seq)
            }
            None => match self.catalog.active_marks(group).first() {
                Some(m) => (Some(m.name.clone()), m.global_seq),
                None => (None, 0),
            },
        };
        let (to_mark, up_to) = match to {
            Some(mark) => {
                let m = self.catalog.resolve_mark(group, mark)?;
                (Some(m.name.clone()), m.global_seq)
            }
            None => (None, u64::MAX),
        };
        if up_to < after {
            return Err(EngineError::InvalidRange(format!(
                "mark '{}' is older than mark '{}'",
                to_mark.unwrap_or_default(),
                from_mark.unwrap_or_default()
            )));
        }

        let mut stats = Vec::new();
        for rel in self.catalog.relations_of(group) {
            if rel.kind != RelationKind::Table {
                continue;
            }
            stats.push(LogStat {
                relation: rel.name.clone(),
                from_mark: from_mark.clone(),
                to_mark: to_mark.clone(),
                rows: self.backend.count(&rel.name, after, up_to)?,
            });
        }
        Ok(stats)
    }
}
