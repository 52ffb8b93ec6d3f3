use std::sync::Arc;

use crate::config::catalog::Catalog;
use crate::config::settings::EngineSettings;
use crate::drivers::Backend;
use crate::drivers::selector::select_backend;
use crate::error::EngineResult;
use crate::storage::Workspace;

/// Entry point of every mark, rollback and diagnostic operation.
///
/// The engine owns the catalog and writes it back after each operation
/// when it was opened from a workspace.
pub struct Engine {
    pub(crate) catalog: Catalog,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) settings: EngineSettings,
    workspace: Option<Workspace>,
}

impl Engine {
    /// Engine over an in-process catalog; nothing is persisted.
    pub fn new(catalog: Catalog, backend: Arc<dyn Backend>, settings: EngineSettings) -> Self {
        Self {
            catalog,
            backend,
            settings,
            workspace: None,
        }
    }

    pub fn open(workspace: Workspace) -> EngineResult<Self> {
        let catalog = workspace.load_catalog()?;
        let settings = workspace.load_settings()?;
        let backend = select_backend(&workspace, &settings)?;
        tracing::debug!(
            root = %workspace.root().display(),
            driver = backend.name(),
            "workspace opened"
        );
        Ok(Self {
            catalog,
            backend,
            settings,
            workspace: Some(workspace),
        })
    }

    /// Same as `open`, with an explicit backend.
    pub fn open_with_backend(workspace: Workspace, backend: Arc<dyn Backend>) -> EngineResult<Self> {
        let catalog = workspace.load_catalog()?;
        let settings = workspace.load_settings()?;
        Ok(Self {
            catalog,
            backend,
            settings,
            workspace: Some(workspace),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Direct catalog access for the group administration layer.
    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut EngineSettings {
        &mut self.settings
    }

    /// Persist the catalog and flush the backend.
    pub fn commit(&mut self) -> EngineResult<()> {
        self.catalog.touch();
        if let Some(ws) = &self.workspace {
            ws.save_catalog(&self.catalog)?;
        }
        self.backend.flush()
    }
}
