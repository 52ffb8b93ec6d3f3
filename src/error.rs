use thiserror::Error;

/// Coarse classification of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown group/mark/relation or misuse of a reserved name. No side effect happened.
    UserInput,
    /// The group or mark is not in the state the operation requires. No side effect happened.
    InvalidState,
    /// Lock contention that outlived the retry budget.
    ConcurrencyConflict,
    /// Broken invariant or storage failure; needs an operator.
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("group '{0}' does not exist")]
    UnknownGroup(String),

    #[error("mark '{mark}' does not exist in group '{group}'")]
    UnknownMark { group: String, mark: String },

    #[error("relation '{0}' does not exist")]
    UnknownRelation(String),

    #[error("'{0}' is a reserved mark name")]
    ReservedName(String),

    #[error("invalid mark name: {0}")]
    InvalidName(String),

    #[error("mark '{mark}' already exists in group '{group}'")]
    MarkExists { group: String, mark: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("could not lock '{relation}' after {attempts} attempts")]
    DeadlockExceeded { relation: String, attempts: u32 },

    #[error("'{relation}' is locked by {holder}")]
    RelationLocked { relation: String, holder: String },

    #[error("rollback target '{mark}' is unknown for group '{group}'")]
    UnknownTarget { group: String, mark: String },

    #[error("invalid mark range: {0}")]
    InvalidRange(String),

    #[error("no tracked relation in group(s) {0}")]
    EmptyGroup(String),

    #[error("invalid rollback chain: {0}")]
    InvalidChain(String),

    #[error("rollback request {0} was cancelled")]
    Cancelled(u64),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UnknownGroup(_)
            | EngineError::UnknownMark { .. }
            | EngineError::UnknownRelation(_)
            | EngineError::ReservedName(_)
            | EngineError::InvalidName(_)
            | EngineError::MarkExists { .. }
            | EngineError::UnknownTarget { .. }
            | EngineError::InvalidRange(_)
            | EngineError::EmptyGroup(_) => ErrorKind::UserInput,
            EngineError::InvalidState(_)
            | EngineError::InvalidChain(_)
            | EngineError::Cancelled(_) => ErrorKind::InvalidState,
            EngineError::DeadlockExceeded { .. } | EngineError::RelationLocked { .. } => {
                ErrorKind::ConcurrencyConflict
            }
            EngineError::Internal(_)
            | EngineError::Storage(_)
            | EngineError::Io(_)
            | EngineError::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_taxonomy() {
        assert_eq!(
            EngineError::ReservedName("EMAJ_LAST_MARK".into()).kind(),
            ErrorKind::UserInput
        );
        assert_eq!(
            EngineError::InvalidState("at least one mark must remain".into()).kind(),
            ErrorKind::InvalidState
        );
        let err = EngineError::DeadlockExceeded {
            relation: "public.orders".into(),
            attempts: 5,
        };
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert!(err.to_string().contains("5 attempts"));
    }
}
