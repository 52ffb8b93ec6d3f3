use std::fs;
use std::path::{Path, PathBuf};

use crate::config::catalog::Catalog;
use crate::config::settings::EngineSettings;
use crate::error::{EngineError, EngineResult};

pub const WORKSPACE_DIR: &str = ".rewind";

/// On-disk home of a catalog: `<root>/.rewind/`.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Create `.rewind/` with an empty catalog and default settings.
    pub fn init_at(root: &Path) -> EngineResult<Self> {
        let ws = Self::at(root);
        if ws.dir().exists() {
            return Err(EngineError::InvalidState(format!(
                "{} already exists",
                ws.dir().display()
            )));
        }
        fs::create_dir_all(ws.dir())?;
        ws.save_catalog(&Catalog::new())?;
        ws.save_settings(&EngineSettings::default())?;
        Ok(ws)
    }

    /// Search `start` and its parents for a workspace.
    pub fn find_from(start: &Path) -> EngineResult<Self> {
        let mut dir = start.to_path_buf();
        loop {
            if dir.join(WORKSPACE_DIR).is_dir() {
                return Ok(Self::at(&dir));
            }
            if !dir.pop() {
                break;
            }
        }
        Err(EngineError::InvalidState(format!(
            "not inside a rewind workspace ({} not found)",
            WORKSPACE_DIR
        )))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.dir().join("catalog.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir().join("settings.json")
    }

    pub fn load_catalog(&self) -> EngineResult<Catalog> {
        let content = fs::read_to_string(self.catalog_path())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_catalog(&self, catalog: &Catalog) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(catalog)?;
        write_atomically(&self.catalog_path(), &json)?;
        Ok(())
    }

    /// Settings file is optional; missing fields take their defaults.
    pub fn load_settings(&self) -> EngineResult<EngineSettings> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(EngineSettings::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(EngineSettings::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_settings(&self, settings: &EngineSettings) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(settings)?;
        write_atomically(&self.settings_path(), &json)?;
        Ok(())
    }
}

/// Write to a temp file next to `path`, then rename over it.
pub fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!("{}.tmp", file_name));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
