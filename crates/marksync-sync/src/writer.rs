//! Synchronization file writer
//!
//! Executes one [`OutgoingEvent`] at a time against the local directory and
//! the cloud container. File I/O runs on the blocking pool under
//! [`FileCoordinator`] locks. Every replacement is atomic: the content is
//! written to a hidden temporary file in the destination directory, synced,
//! stamped with the source item's modification time and renamed into place.
//!
//! Stamping the modification time keeps both stores on the same version
//! after a copy, so the monitors report the written file as unchanged.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use marksync_core::domain::{CloudMetadataItem, LocalMetadataItem, MetadataItem, OutgoingEvent};
use marksync_core::ports::ICloudContainer;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::coordination::FileCoordinator;
use crate::namer::ConflictNamer;
use crate::SyncError;

/// What the manager has to do after a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing beyond the write itself
    Success,
    /// Local categories at these paths changed and must be reloaded
    Reload(Vec<PathBuf>),
    /// Local categories at these paths were deleted
    Delete(Vec<PathBuf>),
}

/// Directories the writer operates on
#[derive(Debug, Clone)]
pub struct WriterDirectories {
    /// Local bookmarks directory
    pub local: PathBuf,
    /// Documents directory of the cloud container
    pub cloud: PathBuf,
    /// Trash directory of the cloud container
    pub trash: PathBuf,
}

/// Executes resolver output against both stores
pub struct SynchronizationFileWriter {
    container: Arc<dyn ICloudContainer>,
    directories: WriterDirectories,
    device_name: String,
    coordinator: FileCoordinator,
}

impl SynchronizationFileWriter {
    /// Creates a writer
    ///
    /// # Arguments
    /// * `container` - Cloud container used for downloads and versions
    /// * `directories` - Local, cloud documents and cloud trash directories
    /// * `device_name` - Suffix for local copies kept on initial conflicts
    pub fn new(
        container: Arc<dyn ICloudContainer>,
        directories: WriterDirectories,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            container,
            directories,
            device_name: device_name.into(),
            coordinator: FileCoordinator::default(),
        }
    }

    /// Replaces the default file coordinator
    pub fn with_coordinator(mut self, coordinator: FileCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn directories(&self) -> &WriterDirectories {
        &self.directories
    }

    /// Executes one outgoing event
    ///
    /// Returns once the operation has completed on disk.
    ///
    /// # Errors
    /// Returns [`SyncError`] if a file operation or container request fails.
    /// A missing source yields [`SyncError::PathNotFound`].
    #[instrument(skip(self, event), fields(kind = event.kind(), file = ?event.file_name()))]
    pub async fn write(&self, event: &OutgoingEvent) -> Result<WriteOutcome, SyncError> {
        match event {
            OutgoingEvent::StartDownloading(item) => self.start_downloading(item).await,
            OutgoingEvent::CreateLocalItem(item) => self.write_to_local(item, false).await,
            OutgoingEvent::UpdateLocalItem(item) => self.write_to_local(item, true).await,
            OutgoingEvent::RemoveLocalItem(item) => self.remove_from_local(item).await,
            OutgoingEvent::CreateCloudItem(item) => self.write_to_cloud(item, false).await,
            OutgoingEvent::UpdateCloudItem(item) => self.write_to_cloud(item, true).await,
            OutgoingEvent::RemoveCloudItem(item) => self.remove_from_cloud(item).await,
            OutgoingEvent::ResolveVersionsConflict(item) => {
                self.resolve_versions_conflict(item).await
            }
            OutgoingEvent::ResolveInitialSynchronizationConflict(item) => {
                self.resolve_initial_synchronization_conflict(item).await
            }
            OutgoingEvent::DidFinishInitialSynchronization | OutgoingEvent::DidReceiveError(_) => {
                Ok(WriteOutcome::Success)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Cloud to local
    // ------------------------------------------------------------------------

    async fn start_downloading(&self, item: &CloudMetadataItem) -> Result<WriteOutcome, SyncError> {
        self.container
            .start_downloading(item.file_url())
            .await
            .map_err(|e| SyncError::Container(format!("{e:#}")))?;
        debug!(path = %item.file_url().display(), "Download requested");
        Ok(WriteOutcome::Success)
    }

    async fn write_to_local(
        &self,
        item: &CloudMetadataItem,
        replace: bool,
    ) -> Result<WriteOutcome, SyncError> {
        let destination = self.directories.local.join(item.file_name());
        let written = self
            .copy(
                item.file_url().to_path_buf(),
                destination.clone(),
                item.last_modification_date(),
                replace,
            )
            .await?;

        if !written {
            debug!(path = %destination.display(), "Local item already exists, skipping");
            return Ok(WriteOutcome::Success);
        }
        info!(path = %destination.display(), replace, "Wrote local item");
        Ok(WriteOutcome::Reload(vec![destination]))
    }

    async fn remove_from_local(&self, item: &CloudMetadataItem) -> Result<WriteOutcome, SyncError> {
        let path = self.directories.local.join(item.file_name());
        let coordinator = self.coordinator;
        let target = path.clone();
        run_blocking(move || {
            coordinator.coordinate_writing(&target, || match fs::remove_file(&target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(SyncError::IoError(e)),
            })
        })
        .await?;

        info!(path = %path.display(), "Removed local item");
        Ok(WriteOutcome::Delete(vec![path]))
    }

    // ------------------------------------------------------------------------
    // Local to cloud
    // ------------------------------------------------------------------------

    async fn write_to_cloud(
        &self,
        item: &LocalMetadataItem,
        replace: bool,
    ) -> Result<WriteOutcome, SyncError> {
        let destination = self.directories.cloud.join(item.file_name());
        let written = self
            .copy(
                item.file_url().to_path_buf(),
                destination.clone(),
                item.last_modification_date(),
                replace,
            )
            .await?;

        if written {
            info!(path = %destination.display(), replace, "Wrote cloud item");
        } else {
            debug!(path = %destination.display(), "Cloud item already exists, skipping");
        }
        Ok(WriteOutcome::Success)
    }

    async fn remove_from_cloud(&self, item: &LocalMetadataItem) -> Result<WriteOutcome, SyncError> {
        let cloud_path = self.directories.cloud.join(item.file_name());
        let source = cloud_path.clone();
        let trashed = self.directories.trash.join(item.file_name());
        let coordinator = self.coordinator;

        let moved = run_blocking(move || {
            coordinator.coordinate_writing(&source, || move_to_trash(&source, &trashed))
        })
        .await?;
        if moved {
            info!(file = item.file_name(), "Moved cloud item to trash");
            return Ok(WriteOutcome::Success);
        }

        // No materialized file; the entry may still exist remotely
        let trashed = self
            .container
            .trash_item(&cloud_path)
            .await
            .map_err(|e| SyncError::Container(format!("{e:#}")))?;
        if trashed {
            info!(file = item.file_name(), "Moved not downloaded cloud item to trash");
        } else {
            debug!(file = item.file_name(), "Cloud item already gone");
        }
        Ok(WriteOutcome::Success)
    }

    // ------------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------------

    async fn resolve_versions_conflict(
        &self,
        item: &CloudMetadataItem,
    ) -> Result<WriteOutcome, SyncError> {
        let versions = self
            .container
            .unresolved_versions(item.file_url())
            .await
            .map_err(|e| SyncError::Container(format!("{e:#}")))?;

        if let Some(latest) = versions.iter().max_by_key(|v| v.modification_date) {
            let cloud_dir = self.directories.cloud.clone();
            let copy_name =
                ConflictNamer::version_copy_name(item.file_name(), |n| cloud_dir.join(n).exists());
            let destination = cloud_dir.join(&copy_name);

            self.copy(latest.url.clone(), destination, latest.modification_date, false)
                .await?;
            info!(
                file = item.file_name(),
                copy = %copy_name,
                versions = versions.len(),
                "Kept latest conflicting version"
            );
        } else {
            warn!(file = item.file_name(), "Conflict reported without unresolved versions");
        }

        self.container
            .resolve_versions(item.file_url())
            .await
            .map_err(|e| SyncError::Container(format!("{e:#}")))?;
        Ok(WriteOutcome::Success)
    }

    async fn resolve_initial_synchronization_conflict(
        &self,
        item: &LocalMetadataItem,
    ) -> Result<WriteOutcome, SyncError> {
        let local_dir = self.directories.local.clone();
        let copy_name = ConflictNamer::device_copy_name(item.file_name(), &self.device_name, |n| {
            local_dir.join(n).exists()
        });
        let destination = local_dir.join(&copy_name);

        self.copy(
            item.file_url().to_path_buf(),
            destination.clone(),
            item.last_modification_date(),
            false,
        )
        .await?;

        info!(file = item.file_name(), copy = %copy_name, "Preserved local item");
        Ok(WriteOutcome::Reload(vec![destination]))
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Copies `source` over `destination`, returning false if `replace` is
    /// unset and the destination already exists
    async fn copy(
        &self,
        source: PathBuf,
        destination: PathBuf,
        modified: DateTime<Utc>,
        replace: bool,
    ) -> Result<bool, SyncError> {
        let coordinator = self.coordinator;
        run_blocking(move || {
            coordinator.coordinate_reading_writing(&source, &destination, || {
                if !replace && destination.exists() {
                    return Ok(false);
                }
                replace_file(&source, &destination, SystemTime::from(modified))?;
                Ok(true)
            })
        })
        .await
    }
}

impl std::fmt::Debug for SynchronizationFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizationFileWriter")
            .field("directories", &self.directories)
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

async fn run_blocking<R, F>(operation: F) -> Result<R, SyncError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, SyncError> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| SyncError::IoError(io::Error::other(e)))?
}

/// Atomically replaces `destination` with the content of `source`
fn replace_file(source: &Path, destination: &Path, modified: SystemTime) -> io::Result<()> {
    let directory = destination
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(directory)?;

    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temporary = directory.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let result = (|| {
        let mut input = File::open(source)?;
        let mut output = File::create(&temporary)?;
        io::copy(&mut input, &mut output)?;
        output.sync_all()?;
        output.set_modified(modified)?;
        drop(output);
        fs::rename(&temporary, destination)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temporary);
    }
    result
}

/// Moves `source` into the trash as `trashed`, replacing a stale entry
///
/// Returns false if `source` does not exist.
fn move_to_trash(source: &Path, trashed: &Path) -> Result<bool, SyncError> {
    if !source.exists() {
        return Ok(false);
    }
    if let Some(trash_dir) = trashed.parent() {
        fs::create_dir_all(trash_dir)?;
    }
    match fs::remove_file(trashed) {
        Ok(()) => debug!(path = %trashed.display(), "Removed stale trashed item"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    match fs::rename(source, trashed) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            let modified = fs::metadata(source)?.modified()?;
            replace_file(source, trashed, modified)?;
            fs::remove_file(source)?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}
