use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::rollback::RollbackRequest;

/// Mark name that always designates the most recent active mark of a group.
pub const LAST_MARK: &str = "EMAJ_LAST_MARK";

/// Everything the engine persists between invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub date_created: DateTime<Local>,
    pub last_updated: DateTime<Local>,
    pub groups: Vec<Group>,
    pub relations: Vec<TrackedRelation>,
    pub marks: Vec<Mark>,
    #[serde(default)]
    pub requests: Vec<RollbackRequest>,
    #[serde(default = "first_id")]
    pub next_mark_id: u64,
    #[serde(default = "first_id")]
    pub next_request_id: u64,
}

fn first_id() -> u64 {
    1
}

impl Catalog {
    pub fn new() -> Self {
        let now = Local::now();
        Self {
            date_created: now,
            last_updated: now,
            groups: Vec::new(),
            relations: Vec::new(),
            marks: Vec::new(),
            requests: Vec::new(),
            next_mark_id: 1,
            next_request_id: 1,
        }
    }

    pub fn group(&self, name: &str) -> EngineResult<&Group> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| EngineError::UnknownGroup(name.to_string()))
    }

    pub fn group_mut(&mut self, name: &str) -> EngineResult<&mut Group> {
        self.groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| EngineError::UnknownGroup(name.to_string()))
    }

    /// Tracked relations of a group, in relation id order.
    pub fn relations_of(&self, group: &str) -> Vec<&TrackedRelation> {
        let mut rels: Vec<&TrackedRelation> =
            self.relations.iter().filter(|r| r.group == group).collect();
        rels.sort_by_key(|r| r.id);
        rels
    }

    /// Active marks of a group, oldest first.
    pub fn active_marks(&self, group: &str) -> Vec<&Mark> {
        let mut marks: Vec<&Mark> = self
            .marks
            .iter()
            .filter(|m| m.group == group && m.state == MarkState::Active)
            .collect();
        marks.sort_by_key(|m| m.global_seq);
        marks
    }

    pub fn resolve_mark(&self, group: &str, mark: &MarkRef) -> EngineResult<&Mark> {
        self.group(group)?;
        let found = match mark {
            MarkRef::Latest => self.active_marks(group).last().copied(),
            MarkRef::Named(name) => self
                .marks
                .iter()
                .find(|m| m.group == group && m.name == *name && m.state == MarkState::Active),
        };
        found.ok_or_else(|| EngineError::UnknownMark {
            group: group.to_string(),
            mark: mark.to_string(),
        })
    }

    pub fn mark_mut(&mut self, id: u64) -> EngineResult<&mut Mark> {
        self.marks
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| EngineError::Internal(format!("mark id {} vanished", id)))
    }

    pub fn request(&self, id: u64) -> EngineResult<&RollbackRequest> {
        self.requests
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::Internal(format!("rollback request {} vanished", id)))
    }

    pub fn request_mut(&mut self, id: u64) -> EngineResult<&mut RollbackRequest> {
        self.requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::Internal(format!("rollback request {} vanished", id)))
    }

    /// Register a group. Group administration lives outside the engine;
    /// this is its entry point into the catalog.
    pub fn add_group(&mut self, name: &str, state: GroupState, logging_since: u64) {
        self.groups.push(Group {
            name: name.to_string(),
            state,
            logging_since,
            comment: None,
        });
    }

    /// Assign a relation to a group and return its id.
    pub fn add_relation(&mut self, group: &str, name: &str, kind: RelationKind) -> EngineResult<u32> {
        self.group(group)?;
        if let Some(existing) = self.relations.iter().find(|r| r.name == name) {
            return Err(EngineError::InvalidState(format!(
                "relation '{}' already belongs to group '{}'",
                name, existing.group
            )));
        }
        let id = self.relations.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        self.relations.push(TrackedRelation {
            id,
            name: name.to_string(),
            kind,
            group: group.to_string(),
            key_column: default_key_column(),
        });
        Ok(id)
    }

    pub fn touch(&mut self) {
        self.last_updated = Local::now();
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    Idle,
    Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub state: GroupState,
    /// Global sequence value at which logging last started.
    #[serde(default)]
    pub logging_since: u64,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationKind {
    Table,
    Sequence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedRelation {
    /// Stable identifier; also the lock acquisition order.
    pub id: u32,
    /// Qualified relation name, e.g. `public.orders`.
    pub name: String,
    pub kind: RelationKind,
    pub group: String,
    /// Primary key column, used when rendering replay scripts.
    #[serde(default = "default_key_column")]
    pub key_column: String,
}

fn default_key_column() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkState {
    Active,
    Deleted,
}

/// Value of a sequence as frozen by a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceState {
    pub last_value: i64,
    pub is_called: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mark {
    pub id: u64,
    pub group: String,
    pub name: String,
    pub created_at: DateTime<Local>,
    /// Slot taken from the global sequence; every log record below it precedes the mark.
    pub global_seq: u64,
    pub state: MarkState,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub comment: Option<String>,
    /// Last change log position of each table when the mark was set.
    #[serde(default)]
    pub positions: BTreeMap<String, u64>,
    #[serde(default)]
    pub sequences: BTreeMap<String, SequenceState>,
    /// Log rows of each table between the previous active mark and this one.
    /// They must stay in the log for a rollback to cross this mark.
    #[serde(default)]
    pub rows_since_previous: BTreeMap<String, u64>,
    /// Set on the START mark of a logged rollback.
    #[serde(default)]
    pub logged_rollback_target: Option<String>,
}

impl Mark {
    pub fn is_active(&self) -> bool {
        self.state == MarkState::Active
    }
}

/// A mark designation as given by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkRef {
    Named(String),
    Latest,
}

impl MarkRef {
    pub fn parse(name: &str) -> Self {
        if name == LAST_MARK {
            MarkRef::Latest
        } else {
            MarkRef::Named(name.to_string())
        }
    }
}

impl std::fmt::Display for MarkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkRef::Named(name) => f.write_str(name),
            MarkRef::Latest => f.write_str(LAST_MARK),
        }
    }
}

impl From<&str> for MarkRef {
    fn from(name: &str) -> Self {
        MarkRef::parse(name)
    }
}
