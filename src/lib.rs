//! Mark-based rollback of tracked table groups.
//!
//! Marks freeze the change log position and sequence values of a group;
//! rollbacks undo every logged change newer than a mark, in parallel
//! sessions, either discarding the undone changes or logging them.

pub mod changelog;
pub mod config;
pub mod consolidate;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod logging;
pub mod marks;
pub mod rollback;
pub mod stats;
pub mod storage;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use engine::Engine;
pub use error::{EngineError, EngineResult, ErrorKind};
