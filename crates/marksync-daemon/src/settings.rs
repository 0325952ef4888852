//! File-backed settings store
//!
//! Persists the two synchronization flags as a small JSON document and
//! publishes the enabled flag through a watch channel.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use marksync_core::ports::ISettingsStore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

/// On-disk representation of the settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSettings {
    pub cloud_sync_enabled: bool,
    pub initial_synchronization_completed: bool,
}

/// Settings stored in a JSON file
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    current: Mutex<PersistedSettings>,
    enabled: watch::Sender<bool>,
}

impl FileSettingsStore {
    /// Opens the store at `path`, starting from defaults if the file is missing
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?
        } else {
            debug!(path = %path.display(), "No settings file, using defaults");
            PersistedSettings::default()
        };

        let (enabled, _) = watch::channel(current.cloud_sync_enabled);
        Ok(Self {
            path,
            current: Mutex::new(current),
            enabled,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> PersistedSettings {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` and writes the result atomically
    fn update(&self, change: impl FnOnce(&mut PersistedSettings)) -> Result<PersistedSettings> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = *current;
        change(&mut next);
        if next == *current {
            return Ok(next);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&next).context("Failed to encode settings")?;
        let temporary = self.path.with_extension("json.tmp");
        std::fs::write(&temporary, content)
            .with_context(|| format!("Failed to write {}", temporary.display()))?;
        std::fs::rename(&temporary, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        *current = next;
        debug!(
            cloud_sync_enabled = next.cloud_sync_enabled,
            initial_synchronization_completed = next.initial_synchronization_completed,
            "Settings saved"
        );
        Ok(next)
    }
}

impl ISettingsStore for FileSettingsStore {
    fn is_cloud_sync_enabled(&self) -> bool {
        self.snapshot().cloud_sync_enabled
    }

    fn set_cloud_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.update(|settings| settings.cloud_sync_enabled = enabled)?;
        self.enabled.send_if_modified(|current| {
            let modified = *current != enabled;
            *current = enabled;
            modified
        });
        Ok(())
    }

    fn initial_synchronization_completed(&self) -> bool {
        self.snapshot().initial_synchronization_completed
    }

    fn set_initial_synchronization_completed(&self, completed: bool) -> Result<()> {
        if let Err(e) = self.update(|settings| settings.initial_synchronization_completed = completed) {
            warn!(error = %e, "Failed to persist initial synchronization flag");
            return Err(e);
        }
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let store = FileSettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.snapshot(), PersistedSettings::default());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_changes_are_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/settings.json");

        let store = FileSettingsStore::open(&path).unwrap();
        store.set_cloud_sync_enabled(true).unwrap();
        store.set_initial_synchronization_completed(true).unwrap();

        let reopened = FileSettingsStore::open(&path).unwrap();
        assert!(reopened.is_cloud_sync_enabled());
        assert!(reopened.initial_synchronization_completed());
        assert!(!dir.path().join("nested/settings.json.tmp").exists());
    }

    #[test]
    fn test_subscribers_see_enabled_changes() {
        let dir = TempDir::new().unwrap();
        let store = FileSettingsStore::open(dir.path().join("settings.json")).unwrap();
        let mut receiver = store.subscribe();

        store.set_cloud_sync_enabled(true).unwrap();
        assert!(receiver.has_changed().unwrap());
        assert!(*receiver.borrow_and_update());

        // Same value again does not notify
        store.set_cloud_sync_enabled(true).unwrap();
        assert!(!receiver.has_changed().unwrap());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"cloud_sync_enabled": true}"#).unwrap();

        let store = FileSettingsStore::open(&path).unwrap();
        assert!(store.is_cloud_sync_enabled());
        assert!(!store.initial_synchronization_completed());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FileSettingsStore::open(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse settings"));
    }
}
