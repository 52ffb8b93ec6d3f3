use std::sync::Arc;

use super::Backend;
use super::memory::MemoryDatabase;
use crate::config::settings::EngineSettings;
use crate::error::EngineResult;
use crate::storage::Workspace;

pub fn select_backend(workspace: &Workspace, settings: &EngineSettings) -> EngineResult<Arc<dyn Backend>> {
    let target = settings.database.trim();
    if target == "memory:" || target.is_empty() {
        return Ok(Arc::new(MemoryDatabase::new()));
    }
    let path = target.strip_prefix("file:").unwrap_or(target);
    let path = workspace.dir().join(path);
    tracing::debug!(path = %path.display(), "opening file database");
    Ok(Arc::new(MemoryDatabase::open(&path)?))
}
