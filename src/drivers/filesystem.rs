use std::fs;
use std::path::Path;

use super::memory::{DatabaseState, MemoryDatabase};
use crate::error::{EngineError, EngineResult};
use crate::storage::write_atomically;

impl MemoryDatabase {
    /// Open the database stored at `path`; a missing file yields an empty database.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let state = if path.exists() {
            let content = fs::read_to_string(path)?;
            if content.trim().is_empty() {
                DatabaseState::default()
            } else {
                serde_json::from_str::<DatabaseState>(&content)?
            }
        } else {
            DatabaseState::default()
        };
        let mut db = MemoryDatabase::from_state(state);
        db.path = Some(path.to_path_buf());
        Ok(db)
    }

    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        let json = {
            let state = self.state()?;
            serde_json::to_string_pretty(&*state)?
        };
        write_atomically(path, &json)
            .map_err(|e| EngineError::Storage(format!("cannot write {}: {}", path.display(), e)))
    }
}
