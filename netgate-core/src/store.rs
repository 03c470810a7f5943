//! JSON state file for the registry

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::registry::{Registry, Settings};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Registry persisted as pretty JSON
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry, or start a fresh one with `settings` if the file is absent
    pub fn load_or_init(&self, settings: Settings) -> Result<Registry, StoreError> {
        if !self.path.exists() {
            tracing::info!("No state at {}, starting empty", self.path.display());
            return Ok(Registry::new(settings));
        }

        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the registry through a temp file and rename it into place
    pub fn save(&self, registry: &Registry) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(registry)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}
