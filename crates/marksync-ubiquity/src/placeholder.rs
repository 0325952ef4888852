//! Placeholder records
//!
//! A file that exists in the container but has not been downloaded is
//! represented in `Documents/` by a hidden `.<name>.icloud` JSON file. The
//! record carries what a metadata query reports for such a file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use marksync_core::domain::ProviderError;
use serde::{Deserialize, Serialize};

use crate::ContainerError;

const PLACEHOLDER_SUFFIX: &str = ".icloud";

/// Provider failure stored in a placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProviderError {
    pub code: i64,
    pub description: String,
}

impl From<StoredProviderError> for ProviderError {
    fn from(error: StoredProviderError) -> Self {
        ProviderError::new(error.code, error.description)
    }
}

/// Contents of a `.<name>.icloud` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    /// Name of the file once downloaded
    pub file_name: String,
    /// Modification date of the remote content
    pub modification_date: DateTime<Utc>,
    /// Download progress in percent
    #[serde(default)]
    pub percent_downloaded: f64,
    /// Last download failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloading_error: Option<StoredProviderError>,
}

impl Placeholder {
    pub fn new(file_name: impl Into<String>, modification_date: DateTime<Utc>) -> Self {
        Self {
            file_name: file_name.into(),
            modification_date,
            percent_downloaded: 0.0,
            downloading_error: None,
        }
    }

    /// Reads a placeholder record
    ///
    /// # Errors
    /// Returns [`ContainerError::InvalidPlaceholder`] if the file is not a
    /// valid record, or [`ContainerError::Io`] if it cannot be read.
    pub fn read(path: &Path) -> Result<Self, ContainerError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| ContainerError::InvalidPlaceholder {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Writes the record to `path`
    pub fn write(&self, path: &Path) -> Result<(), ContainerError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ContainerError::InvalidPlaceholder {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Placeholder path for `file_name` inside `documents`
pub fn placeholder_path(documents: &Path, file_name: &str) -> PathBuf {
    documents.join(format!(".{file_name}{PLACEHOLDER_SUFFIX}"))
}

/// Returns the file name a placeholder file name stands for
///
/// `.Trip.kml.icloud` gives `Trip.kml`.
pub fn placeholder_target(placeholder_name: &str) -> Option<&str> {
    placeholder_name
        .strip_prefix('.')?
        .strip_suffix(PLACEHOLDER_SUFFIX)
        .filter(|name| !name.is_empty())
}
