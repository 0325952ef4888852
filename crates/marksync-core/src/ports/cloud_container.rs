//! Cloud container port (driven/secondary port)
//!
//! A cloud container is a directory kept in sync with other devices by the
//! platform. The engine only sees it through this trait: a documents
//! directory it can copy files into, a trash directory, a metadata query and
//! a handful of provider requests.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because failures are provider-specific; callers
//!   map them onto [`SynchronizationError`](crate::domain::SynchronizationError).
//! - `query` returns raw [`CloudItemAttributes`]; parsing into typed items
//!   happens in the cloud monitor.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::domain::CloudItemAttributes;

/// Result of one metadata query over the container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudQueryResult {
    /// Live and trashed entries matching the query
    pub items: Vec<CloudItemAttributes>,
}

/// One unresolved version of a conflicted cloud file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    /// Readable location of the version's content
    pub url: PathBuf,
    /// When this version was written
    pub modification_date: DateTime<Utc>,
}

/// Port trait for the cloud-replicated container
#[async_trait::async_trait]
pub trait ICloudContainer: Send + Sync {
    /// Returns true if the account and container can be used right now
    fn is_available(&self) -> bool;

    /// Resolves the directory holding the synchronized documents
    ///
    /// # Errors
    /// Returns an error if the container cannot be located
    async fn resolve_documents_dir(&self) -> anyhow::Result<PathBuf>;

    /// Resolves the directory used as the container trash
    async fn trash_dir(&self) -> anyhow::Result<PathBuf>;

    /// Lists entries whose file name ends with `.{extension}`
    ///
    /// # Arguments
    /// * `extension` - Tracked extension without the leading dot
    async fn query(&self, extension: &str) -> anyhow::Result<CloudQueryResult>;

    /// Requests materialization of a not-downloaded entry
    ///
    /// Calling this for an entry that is already downloaded succeeds.
    async fn start_downloading(&self, path: &Path) -> anyhow::Result<()>;

    /// Moves the entry at `path` into the container trash
    ///
    /// Works for entries that are not downloaded yet. Returns false if the
    /// container has no live entry at `path`.
    async fn trash_item(&self, path: &Path) -> anyhow::Result<bool>;

    /// Lists the diverging versions recorded for `path`
    async fn unresolved_versions(&self, path: &Path) -> anyhow::Result<Vec<FileVersion>>;

    /// Marks every version of `path` as resolved, discarding them
    async fn resolve_versions(&self, path: &Path) -> anyhow::Result<()>;
}
