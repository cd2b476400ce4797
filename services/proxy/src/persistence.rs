//! Service configuration snapshot.
//!
//! The snapshot is the full `GET /_config` document: a JSON array of
//! service configurations. It is written after every successful admin
//! mutation and read once at startup to seed the registry.
//!
//! - Writes go to a temp file that is renamed over the snapshot
//! - A write is skipped when the serialized content matches the last one

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::model::ServiceConfig;

/// Snapshot file manager.
pub struct StatePersistence {
    /// Path to the snapshot file.
    state_path: PathBuf,
    /// Content of the last successful write or load.
    last_written: Mutex<Option<String>>,
}

impl StatePersistence {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            last_written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Load the snapshot.
    ///
    /// Returns an empty list if the file doesn't exist.
    /// Returns an error if the file exists but is invalid.
    pub fn load(&self) -> Result<Vec<ServiceConfig>> {
        if !self.state_path.exists() {
            debug!(path = %self.state_path.display(), "No snapshot file, starting empty");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.state_path).with_context(|| {
            format!("Failed to read snapshot file: {}", self.state_path.display())
        })?;

        let services: Vec<ServiceConfig> = serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse snapshot file: {}", self.state_path.display())
        })?;

        *self.lock() = Some(content);

        info!(
            path = %self.state_path.display(),
            service_count = services.len(),
            "Loaded snapshot from disk"
        );
        Ok(services)
    }

    /// Write the snapshot unless it is byte-identical to the last write.
    ///
    /// Returns whether the file was written.
    pub fn save_if_changed(&self, services: &[ServiceConfig]) -> Result<bool> {
        let content =
            serde_json::to_string_pretty(services).context("Failed to serialize snapshot")?;

        let mut last = self.lock();
        if last.as_deref() == Some(content.as_str()) {
            return Ok(false);
        }

        self.write(&content)?;
        *last = Some(content);

        debug!(
            path = %self.state_path.display(),
            service_count = services.len(),
            "Saved snapshot to disk"
        );
        Ok(true)
    }

    fn write(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let tmp_path = self.state_path.with_extension("tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &self.state_path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.state_path.display()
            )
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_written.lock().unwrap_or_else(|e| e.into_inner())
    }
}
