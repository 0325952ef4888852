//! Metadata items
//!
//! A metadata item describes one tracked file in one of the two stores. Items
//! are matched across stores by [`file_name`](MetadataItem::file_name) only;
//! the full path belongs to whichever store the item was enumerated from.
//!
//! Modification dates are truncated to whole seconds at construction time so
//! that "same version" comparisons are stable across filesystems with
//! different timestamp precision.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{MetadataItemError, ProviderError, SynchronizationError};

/// Drops the sub-second part of a timestamp
pub fn truncate_to_seconds(date: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(date.timestamp(), 0).unwrap_or(date)
}

fn from_system_time(time: SystemTime) -> DateTime<Utc> {
    truncate_to_seconds(DateTime::<Utc>::from(time))
}

fn file_name_of(path: &Path) -> Result<String, MetadataItemError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| MetadataItemError::InvalidFileName(path.display().to_string()))
}

// ============================================================================
// MetadataItem trait
// ============================================================================

/// Attributes shared by local and cloud items
pub trait MetadataItem: Clone + std::fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Base file name, the identity key across stores
    fn file_name(&self) -> &str;

    /// Absolute location inside the owning store
    fn file_url(&self) -> &Path;

    /// Last modification time, truncated to seconds
    fn last_modification_date(&self) -> DateTime<Utc>;

    /// Whether the item lives in the store's trash
    fn is_removed(&self) -> bool {
        false
    }

    /// Returns true if this item is strictly newer than `other`
    fn is_newer_than<O: MetadataItem>(&self, other: &O) -> bool {
        self.last_modification_date() > other.last_modification_date()
    }
}

// ============================================================================
// LocalMetadataItem
// ============================================================================

/// A tracked file in the local bookmarks directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalMetadataItem {
    file_name: String,
    file_url: PathBuf,
    last_modification_date: DateTime<Utc>,
}

impl LocalMetadataItem {
    /// Creates a local item, truncating the modification date to seconds
    pub fn new(
        file_name: impl Into<String>,
        file_url: impl Into<PathBuf>,
        last_modification_date: DateTime<Utc>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_url: file_url.into(),
            last_modification_date: truncate_to_seconds(last_modification_date),
        }
    }

    /// Builds an item from a file on disk
    ///
    /// # Errors
    /// Returns [`MetadataItemError`] if the path has no usable file name, is
    /// not a regular file, or its metadata cannot be read.
    pub fn from_path(path: &Path) -> Result<Self, MetadataItemError> {
        let file_name = file_name_of(path)?;
        let metadata = std::fs::metadata(path).map_err(|e| MetadataItemError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !metadata.is_file() {
            return Err(MetadataItemError::NotAFile(path.display().to_string()));
        }
        let modified = metadata.modified().map_err(|e| MetadataItemError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            file_name,
            file_url: path.to_path_buf(),
            last_modification_date: from_system_time(modified),
        })
    }
}

impl MetadataItem for LocalMetadataItem {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn file_url(&self) -> &Path {
        &self.file_url
    }

    fn last_modification_date(&self) -> DateTime<Utc> {
        self.last_modification_date
    }
}

// ============================================================================
// CloudItemAttributes - raw provider record
// ============================================================================

/// Raw attributes of one entry returned by a cloud container query
///
/// Every field is optional because providers do not guarantee them; the
/// conversion into [`CloudMetadataItem`] is the single place where they are
/// validated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudItemAttributes {
    /// Location of the item inside the container
    pub url: Option<PathBuf>,
    /// Display name; falls back to the last component of `url`
    pub display_name: Option<String>,
    /// Last content change reported by the provider
    pub content_change_date: Option<SystemTime>,
    /// Whether the content is materialized locally
    pub is_downloaded: Option<bool>,
    /// Download progress in percent (0.0 - 100.0)
    pub percent_downloaded: Option<f64>,
    /// Whether several devices wrote diverging versions
    pub has_unresolved_conflicts: Option<bool>,
    /// Last download failure reported by the provider
    pub downloading_error: Option<ProviderError>,
    /// Last upload failure reported by the provider
    pub uploading_error: Option<ProviderError>,
    /// Whether the entry lives in the container trash
    pub is_removed: bool,
}

// ============================================================================
// CloudMetadataItem
// ============================================================================

/// A tracked file in the cloud container
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloudMetadataItem {
    file_name: String,
    file_url: PathBuf,
    last_modification_date: DateTime<Utc>,
    is_downloaded: bool,
    percent_downloaded: u8,
    has_unresolved_conflicts: bool,
    downloading_error: Option<SynchronizationError>,
    uploading_error: Option<SynchronizationError>,
    is_removed: bool,
}

impl CloudMetadataItem {
    /// Creates a downloaded, live, conflict-free cloud item
    pub fn new(
        file_name: impl Into<String>,
        file_url: impl Into<PathBuf>,
        last_modification_date: DateTime<Utc>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_url: file_url.into(),
            last_modification_date: truncate_to_seconds(last_modification_date),
            is_downloaded: true,
            percent_downloaded: 100,
            has_unresolved_conflicts: false,
            downloading_error: None,
            uploading_error: None,
            is_removed: false,
        }
    }

    /// Marks the item as known but not yet materialized
    pub fn not_downloaded(mut self) -> Self {
        self.is_downloaded = false;
        self.percent_downloaded = 0;
        self
    }

    /// Marks the item as trashed
    pub fn removed(mut self) -> Self {
        self.is_removed = true;
        self
    }

    /// Flags diverging versions written by several devices
    pub fn with_unresolved_conflicts(mut self) -> Self {
        self.has_unresolved_conflicts = true;
        self
    }

    /// Attaches a download failure
    pub fn with_downloading_error(mut self, error: SynchronizationError) -> Self {
        self.downloading_error = Some(error);
        self
    }

    /// Attaches an upload failure
    pub fn with_uploading_error(mut self, error: SynchronizationError) -> Self {
        self.uploading_error = Some(error);
        self
    }

    pub fn is_downloaded(&self) -> bool {
        self.is_downloaded
    }

    pub fn percent_downloaded(&self) -> u8 {
        self.percent_downloaded
    }

    pub fn has_unresolved_conflicts(&self) -> bool {
        self.has_unresolved_conflicts
    }

    pub fn downloading_error(&self) -> Option<&SynchronizationError> {
        self.downloading_error.as_ref()
    }

    pub fn uploading_error(&self) -> Option<&SynchronizationError> {
        self.uploading_error.as_ref()
    }

    /// Returns the first transfer error, download before upload
    pub fn transfer_error(&self) -> Option<&SynchronizationError> {
        self.downloading_error.as_ref().or(self.uploading_error.as_ref())
    }
}

impl MetadataItem for CloudMetadataItem {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn file_url(&self) -> &Path {
        &self.file_url
    }

    fn last_modification_date(&self) -> DateTime<Utc> {
        self.last_modification_date
    }

    fn is_removed(&self) -> bool {
        self.is_removed
    }
}

impl TryFrom<CloudItemAttributes> for CloudMetadataItem {
    type Error = MetadataItemError;

    fn try_from(attributes: CloudItemAttributes) -> Result<Self, Self::Error> {
        let file_url = attributes
            .url
            .ok_or(MetadataItemError::MissingAttribute("url"))?;
        let file_name = match attributes.display_name {
            Some(name) if !name.is_empty() => name,
            _ => file_name_of(&file_url)?,
        };
        let modified = attributes
            .content_change_date
            .ok_or(MetadataItemError::MissingAttribute("content_change_date"))?;
        let is_downloaded = attributes
            .is_downloaded
            .ok_or(MetadataItemError::MissingAttribute("is_downloaded"))?;

        let percent_downloaded = match attributes.percent_downloaded {
            Some(percent) => percent.clamp(0.0, 100.0).round() as u8,
            None if is_downloaded => 100,
            None => 0,
        };

        Ok(Self {
            file_name,
            file_url,
            last_modification_date: from_system_time(modified),
            is_downloaded,
            percent_downloaded,
            has_unresolved_conflicts: attributes.has_unresolved_conflicts.unwrap_or(false),
            downloading_error: attributes
                .downloading_error
                .map(SynchronizationError::from_provider_error),
            uploading_error: attributes
                .uploading_error
                .map(SynchronizationError::from_provider_error),
            is_removed: attributes.is_removed,
        })
    }
}
