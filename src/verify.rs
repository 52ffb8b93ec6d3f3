// Verifier
//
// Read-only consistency checks across the catalog and the backend. Each
// check is an independent rule; all of them run and every violation found
// is reported.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::config::catalog::{Catalog, RelationKind};
use crate::drivers::Backend;
use crate::engine::Engine;
use crate::error::EngineResult;

/// One broken rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub check: &'static str,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.check, self.detail)
    }
}

/// A consistency rule. Checks must not modify anything.
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, catalog: &Catalog, backend: &dyn Backend) -> EngineResult<Vec<String>>;
}

#[derive(Default)]
pub struct Verifier {
    checks: Vec<Box<dyn Check>>,
}

impl Verifier {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// Every built-in check.
    pub fn standard() -> Self {
        let mut verifier = Self::new();
        verifier.register(RelationsExist);
        verifier.register(LogStoresLinked);
        verifier.register(MarkPositionsInRange);
        verifier.register(LogRetained);
        verifier.register(UniqueMarkNames);
        verifier.register(MarkOrdering);
        verifier.register(RequestsReferenceGroups);
        verifier
    }

    pub fn register<C: Check + 'static>(&mut self, check: C) {
        self.checks.push(Box::new(check));
    }

    pub fn run(&self, catalog: &Catalog, backend: &dyn Backend) -> EngineResult<Vec<Violation>> {
        let mut violations = Vec::new();
        for check in &self.checks {
            for detail in check.run(catalog, backend)? {
                violations.push(Violation {
                    check: check.name(),
                    detail,
                });
            }
        }
        Ok(violations)
    }
}

impl Engine {
    /// Run every consistency check; an empty list means no error detected.
    pub fn verify_all(&self) -> EngineResult<Vec<Violation>> {
        let violations = Verifier::standard().run(&self.catalog, self.backend.as_ref())?;
        if violations.is_empty() {
            tracing::debug!("no error detected");
        } else {
            tracing::warn!(count = violations.len(), "consistency violations found");
        }
        Ok(violations)
    }
}

struct RelationsExist;

impl Check for RelationsExist {
    fn name(&self) -> &'static str {
        "relation-exists"
    }

    fn run(&self, catalog: &Catalog, backend: &dyn Backend) -> EngineResult<Vec<String>> {
        let mut found = Vec::new();
        for rel in &catalog.relations {
            if !backend.relation_exists(&rel.name)? {
                found.push(format!(
                    "relation '{}' of group '{}' does not exist in the database",
                    rel.name, rel.group
                ));
            }
        }
        Ok(found)
    }
}

/// Log stores and tracked tables match one to one.
struct LogStoresLinked;

impl Check for LogStoresLinked {
    fn name(&self) -> &'static str {
        "log-store-linked"
    }

    fn run(&self, catalog: &Catalog, backend: &dyn Backend) -> EngineResult<Vec<String>> {
        let stores: BTreeSet<String> = backend.log_relations()?.into_iter().collect();
        let tables: BTreeSet<&str> = catalog
            .relations
            .iter()
            .filter(|r| r.kind == RelationKind::Table)
            .map(|r| r.name.as_str())
            .collect();

        let mut found = Vec::new();
        for store in &stores {
            if !tables.contains(store.as_str()) {
                found.push(format!("log store of '{}' is not linked to any group", store));
            }
        }
        for table in tables {
            if !stores.contains(table) {
                found.push(format!("tracked table '{}' has no log store", table));
            }
        }
        Ok(found)
    }
}

struct MarkPositionsInRange;

impl Check for MarkPositionsInRange {
    fn name(&self) -> &'static str {
        "mark-position"
    }

    fn run(&self, catalog: &Catalog, backend: &dyn Backend) -> EngineResult<Vec<String>> {
        let head = backend.current()?;
        let mut found = Vec::new();
        for mark in catalog.marks.iter().filter(|m| m.is_active()) {
            if mark.global_seq > head {
                found.push(format!(
                    "mark '{}' of group '{}' is beyond the global sequence ({} > {})",
                    mark.name, mark.group, mark.global_seq, head
                ));
            }
            for (table, position) in &mark.positions {
                if *position >= mark.global_seq {
                    found.push(format!(
                        "mark '{}' of group '{}' records position {} for '{}', not before the mark itself",
                        mark.name, mark.group, position, table
                    ));
                }
            }
        }
        Ok(found)
    }
}

/// Log rows a rollback would cross are still there: between two consecutive
/// active marks the log holds what was recorded when the later one was set.
struct LogRetained;

impl Check for LogRetained {
    fn name(&self) -> &'static str {
        "log-retained"
    }

    fn run(&self, catalog: &Catalog, backend: &dyn Backend) -> EngineResult<Vec<String>> {
        let mut found = Vec::new();
        for group in &catalog.groups {
            let tables: BTreeSet<&str> = catalog
                .relations_of(&group.name)
                .into_iter()
                .filter(|r| r.kind == RelationKind::Table)
                .map(|r| r.name.as_str())
                .collect();
            for pair in catalog.active_marks(&group.name).windows(2) {
                let (previous, mark) = (pair[0], pair[1]);
                for (table, expected) in &mark.rows_since_previous {
                    if !tables.contains(table.as_str()) {
                        continue;
                    }
                    let kept = backend.count(table, previous.global_seq, mark.global_seq)?;
                    if kept != *expected {
                        found.push(format!(
                            "log of '{}' between marks '{}' and '{}' of group '{}' holds {} row(s), {} expected",
                            table, previous.name, mark.name, group.name, kept, expected
                        ));
                    }
                }
            }
        }
        Ok(found)
    }
}

struct UniqueMarkNames;

impl Check for UniqueMarkNames {
    fn name(&self) -> &'static str {
        "unique-mark-name"
    }

    fn run(&self, catalog: &Catalog, _backend: &dyn Backend) -> EngineResult<Vec<String>> {
        let mut seen: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for mark in catalog.marks.iter().filter(|m| m.is_active()) {
            *seen.entry((mark.group.as_str(), mark.name.as_str())).or_default() += 1;
        }
        Ok(seen
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|((group, name), n)| {
                format!("group '{}' has {} active marks named '{}'", group, n, name)
            })
            .collect())
    }
}

/// Id, global sequence and timestamp order of a group's marks agree.
struct MarkOrdering;

impl Check for MarkOrdering {
    fn name(&self) -> &'static str {
        "mark-ordering"
    }

    fn run(&self, catalog: &Catalog, _backend: &dyn Backend) -> EngineResult<Vec<String>> {
        let mut found = Vec::new();
        for group in &catalog.groups {
            let mut marks: Vec<_> = catalog.marks.iter().filter(|m| m.group == group.name).collect();
            marks.sort_by_key(|m| m.id);
            for pair in marks.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                if a.global_seq >= b.global_seq || a.created_at >= b.created_at {
                    found.push(format!(
                        "marks '{}' and '{}' of group '{}' are out of order",
                        a.name, b.name, group.name
                    ));
                }
            }
        }
        Ok(found)
    }
}

struct RequestsReferenceGroups;

impl Check for RequestsReferenceGroups {
    fn name(&self) -> &'static str {
        "request-group"
    }

    fn run(&self, catalog: &Catalog, _backend: &dyn Backend) -> EngineResult<Vec<String>> {
        let mut found = Vec::new();
        for request in &catalog.requests {
            for group in &request.groups {
                if catalog.group(group).is_err() {
                    found.push(format!(
                        "rollback request {} references unknown group '{}'",
                        request.id, group
                    ));
                }
            }
        }
        Ok(found)
    }
}
