//! DirectoryContainer - ICloudContainer implementation over a directory
//!
//! Blocking directory scans run on `spawn_blocking`; everything else uses
//! `tokio::fs`. Hidden entries in `Documents/` are never reported except
//! for placeholders, so temporary files written next to real ones stay
//! invisible to queries.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Utc};
use marksync_core::domain::CloudItemAttributes;
use marksync_core::ports::{CloudQueryResult, FileVersion, ICloudContainer};
use tracing::{debug, info, warn};

use crate::placeholder::{placeholder_path, placeholder_target, Placeholder};
use crate::ContainerError;

const DOCUMENTS_DIR: &str = "Documents";
const TRASH_DIR: &str = ".Trash";
const REMOTE_DIR: &str = ".Remote";
const VERSIONS_DIR: &str = ".Versions";

/// Cloud container backed by a local directory
#[derive(Debug, Clone)]
pub struct DirectoryContainer {
    root: PathBuf,
}

impl DirectoryContainer {
    /// Creates a container rooted at `root`
    ///
    /// Nothing is created on disk; the container is unavailable until the
    /// root exists.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn documents_path(&self) -> PathBuf {
        self.root.join(DOCUMENTS_DIR)
    }

    pub fn trash_path(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    fn remote_path(&self) -> PathBuf {
        self.root.join(REMOTE_DIR)
    }

    fn versions_path(&self, file_name: &str) -> PathBuf {
        self.root.join(VERSIONS_DIR).join(file_name)
    }

    /// Creates the root and its standard directories
    pub async fn create(&self) -> Result<(), ContainerError> {
        tokio::fs::create_dir_all(self.documents_path()).await?;
        tokio::fs::create_dir_all(self.trash_path()).await?;
        info!(root = %self.root.display(), "Created directory container");
        Ok(())
    }

    fn ensure_root(&self) -> Result<(), ContainerError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(ContainerError::NotFound(self.root.clone()))
        }
    }

    // ------------------------------------------------------------------------
    // Changes made by other devices
    // ------------------------------------------------------------------------

    /// Records a file written by another device that is not downloaded yet
    ///
    /// Replaces any materialized file of the same name with a placeholder.
    pub async fn add_remote_file(
        &self,
        file_name: &str,
        content: &[u8],
        modified: DateTime<Utc>,
    ) -> Result<(), ContainerError> {
        self.ensure_root()?;
        let documents = self.documents_path();
        tokio::fs::create_dir_all(&documents).await?;
        tokio::fs::create_dir_all(self.remote_path()).await?;

        tokio::fs::write(self.remote_path().join(file_name), content).await?;
        Placeholder::new(file_name, modified).write(&placeholder_path(&documents, file_name))?;
        match tokio::fs::remove_file(documents.join(file_name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(file = file_name, "Added remote file");
        Ok(())
    }

    /// Records a diverging version of `file_name` written by another device
    ///
    /// Returns the path of the stored version.
    pub async fn add_version(
        &self,
        file_name: &str,
        content: &[u8],
        modified: DateTime<Utc>,
    ) -> Result<PathBuf, ContainerError> {
        self.ensure_root()?;
        let directory = self.versions_path(file_name);
        let path = directory.join(format!("{}.version", modified.timestamp()));

        let target = path.clone();
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            fs::create_dir_all(&directory)?;
            fs::write(&target, content)?;
            fs::File::options()
                .write(true)
                .open(&target)?
                .set_modified(SystemTime::from(modified))
        })
        .await
        .map_err(io::Error::other)??;

        debug!(file = file_name, version = %path.display(), "Added conflicting version");
        Ok(path)
    }

    // ------------------------------------------------------------------------
    // Blocking helpers
    // ------------------------------------------------------------------------

    fn has_unresolved_versions(&self, file_name: &str) -> bool {
        fs::read_dir(self.versions_path(file_name))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    fn scan(&self, extension: &str) -> Result<CloudQueryResult, ContainerError> {
        self.ensure_root()?;
        let mut items = Vec::new();

        let documents = self.documents_path();
        if documents.is_dir() {
            for entry in fs::read_dir(&documents)? {
                let entry = entry?;
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };

                if let Some(target) = placeholder_target(name) {
                    if !has_extension(target, extension) {
                        continue;
                    }
                    match Placeholder::read(&path) {
                        Ok(placeholder) => {
                            items.push(self.placeholder_attributes(&documents, target, placeholder))
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "Skipping placeholder"),
                    }
                    continue;
                }

                if name.starts_with('.') || !has_extension(name, extension) {
                    continue;
                }
                let Some(modified) = file_modified(&entry)? else {
                    continue;
                };
                items.push(CloudItemAttributes {
                    display_name: Some(name.to_string()),
                    content_change_date: Some(modified),
                    is_downloaded: Some(true),
                    percent_downloaded: Some(100.0),
                    has_unresolved_conflicts: Some(self.has_unresolved_versions(name)),
                    url: Some(path),
                    ..Default::default()
                });
            }
        }

        let trash = self.trash_path();
        if trash.is_dir() {
            for entry in fs::read_dir(&trash)? {
                let entry = entry?;
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with('.') || !has_extension(name, extension) {
                    continue;
                }
                let Some(modified) = file_modified(&entry)? else {
                    continue;
                };
                items.push(CloudItemAttributes {
                    display_name: Some(name.to_string()),
                    content_change_date: Some(modified),
                    is_downloaded: Some(true),
                    url: Some(path),
                    is_removed: true,
                    ..Default::default()
                });
            }
        }

        Ok(CloudQueryResult { items })
    }

    fn placeholder_attributes(
        &self,
        documents: &Path,
        file_name: &str,
        placeholder: Placeholder,
    ) -> CloudItemAttributes {
        CloudItemAttributes {
            url: Some(documents.join(file_name)),
            display_name: Some(file_name.to_string()),
            content_change_date: Some(SystemTime::from(placeholder.modification_date)),
            is_downloaded: Some(false),
            percent_downloaded: Some(placeholder.percent_downloaded),
            has_unresolved_conflicts: Some(self.has_unresolved_versions(file_name)),
            downloading_error: placeholder.downloading_error.map(Into::into),
            ..Default::default()
        }
    }

    fn materialize(&self, file_name: &str) -> Result<bool, ContainerError> {
        let documents = self.documents_path();
        let placeholder = placeholder_path(&documents, file_name);
        if !placeholder.exists() {
            return Ok(false);
        }

        let record = Placeholder::read(&placeholder)?;
        let remote = self.remote_path().join(file_name);
        if !remote.exists() {
            return Err(ContainerError::RemoteContentMissing(file_name.to_string()));
        }

        let destination = documents.join(file_name);
        fs::rename(&remote, &destination)?;
        fs::File::options()
            .write(true)
            .open(&destination)?
            .set_modified(SystemTime::from(record.modification_date))?;
        fs::remove_file(&placeholder)?;
        Ok(true)
    }

    fn trash_entry(&self, file_name: &str) -> Result<bool, ContainerError> {
        let documents = self.documents_path();
        let materialized = documents.join(file_name);
        let placeholder = placeholder_path(&documents, file_name);
        let trashed = self.trash_path().join(file_name);

        if materialized.is_file() {
            fs::create_dir_all(self.trash_path())?;
            remove_if_exists(&trashed)?;
            fs::rename(&materialized, &trashed)?;
            return Ok(true);
        }
        if !placeholder.exists() {
            return Ok(false);
        }

        let record = Placeholder::read(&placeholder)?;
        fs::create_dir_all(self.trash_path())?;
        remove_if_exists(&trashed)?;
        match fs::rename(self.remote_path().join(file_name), &trashed) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(file = file_name, "No remote content, trashing an empty entry");
                fs::write(&trashed, b"")?;
            }
            Err(e) => return Err(e.into()),
        }
        fs::File::options()
            .write(true)
            .open(&trashed)?
            .set_modified(SystemTime::from(record.modification_date))?;
        fs::remove_file(&placeholder)?;
        Ok(true)
    }

    fn list_versions(&self, file_name: &str) -> Result<Vec<FileVersion>, ContainerError> {
        let directory = self.versions_path(file_name);
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            versions.push(FileVersion {
                modification_date: DateTime::<Utc>::from(entry.metadata()?.modified()?),
                url: entry.path(),
            });
        }
        versions.sort_by_key(|version| version.modification_date);
        Ok(versions)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Modification date of a regular file entry
///
/// Returns `None` for anything that is not a regular file, and for an entry
/// that was renamed or removed after the directory was listed.
fn file_modified(entry: &fs::DirEntry) -> io::Result<Option<SystemTime>> {
    match entry.metadata().and_then(|metadata| {
        if metadata.is_file() {
            metadata.modified().map(Some)
        } else {
            Ok(None)
        }
    }) {
        Ok(modified) => Ok(modified),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %entry.path().display(), "Entry vanished during scan");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn has_extension(file_name: &str, extension: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

fn file_name_of(path: &Path) -> Result<String, ContainerError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| ContainerError::InvalidPath(path.to_path_buf()))
}

async fn blocking<R, F>(operation: F) -> anyhow::Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, ContainerError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(operation)
        .await
        .context("Container task panicked")??;
    Ok(result)
}

// ============================================================================
// ICloudContainer implementation
// ============================================================================

#[async_trait::async_trait]
impl ICloudContainer for DirectoryContainer {
    fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    async fn resolve_documents_dir(&self) -> anyhow::Result<PathBuf> {
        self.ensure_root()?;
        let documents = self.documents_path();
        tokio::fs::create_dir_all(&documents)
            .await
            .with_context(|| format!("Failed to create {}", documents.display()))?;
        Ok(documents)
    }

    async fn trash_dir(&self) -> anyhow::Result<PathBuf> {
        self.ensure_root()?;
        let trash = self.trash_path();
        tokio::fs::create_dir_all(&trash)
            .await
            .with_context(|| format!("Failed to create {}", trash.display()))?;
        Ok(trash)
    }

    async fn query(&self, extension: &str) -> anyhow::Result<CloudQueryResult> {
        let container = self.clone();
        let extension = extension.to_string();
        blocking(move || container.scan(&extension)).await
    }

    async fn start_downloading(&self, path: &Path) -> anyhow::Result<()> {
        let file_name = file_name_of(path)?;
        let container = self.clone();
        let name = file_name.clone();
        if blocking(move || container.materialize(&name)).await? {
            info!(file = %file_name, "Downloaded remote file");
        } else {
            debug!(file = %file_name, "File already downloaded");
        }
        Ok(())
    }

    async fn trash_item(&self, path: &Path) -> anyhow::Result<bool> {
        let file_name = file_name_of(path)?;
        let container = self.clone();
        let name = file_name.clone();
        let trashed = blocking(move || container.trash_entry(&name)).await?;
        if trashed {
            info!(file = %file_name, "Moved item to trash");
        }
        Ok(trashed)
    }

    async fn unresolved_versions(&self, path: &Path) -> anyhow::Result<Vec<FileVersion>> {
        let file_name = file_name_of(path)?;
        let container = self.clone();
        blocking(move || container.list_versions(&file_name)).await
    }

    async fn resolve_versions(&self, path: &Path) -> anyhow::Result<()> {
        let file_name = file_name_of(path)?;
        match tokio::fs::remove_dir_all(self.versions_path(&file_name)).await {
            Ok(()) => {
                debug!(file = %file_name, "Resolved versions");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to resolve versions of {file_name}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use marksync_core::domain::{CloudMetadataItem, MetadataItem, SynchronizationError};
    use tempfile::TempDir;

    use super::*;
    use crate::placeholder::StoredProviderError;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn container() -> (TempDir, DirectoryContainer) {
        let dir = TempDir::new().unwrap();
        let container = DirectoryContainer::new(dir.path().join("container"));
        container.create().await.unwrap();
        (dir, container)
    }

    fn write_file(path: &Path, content: &str, secs: i64) {
        fs::write(path, content).unwrap();
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::from(at(secs)))
            .unwrap();
    }

    fn parse(result: CloudQueryResult) -> Vec<CloudMetadataItem> {
        let mut items: Vec<CloudMetadataItem> = result
            .items
            .into_iter()
            .map(|attributes| CloudMetadataItem::try_from(attributes).unwrap())
            .collect();
        items.sort_by(|a, b| (a.file_name(), a.is_removed()).cmp(&(b.file_name(), b.is_removed())));
        items
    }

    #[tokio::test]
    async fn test_unavailable_without_root() {
        let dir = TempDir::new().unwrap();
        let container = DirectoryContainer::new(dir.path().join("missing"));
        assert!(!container.is_available());
        assert!(container.resolve_documents_dir().await.is_err());
        assert!(container.query("kml").await.is_err());
    }

    #[tokio::test]
    async fn test_query_reports_live_and_trashed_files() {
        let (_dir, container) = container().await;
        write_file(&container.documents_path().join("a.kml"), "a", 100);
        write_file(&container.documents_path().join("notes.txt"), "x", 100);
        write_file(&container.documents_path().join(".a.kml.tmp"), "tmp", 100);
        write_file(&container.trash_path().join("b.kml"), "b", 200);

        let items = parse(container.query("kml").await.unwrap());

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].file_name(), "a.kml");
        assert!(items[0].is_downloaded());
        assert!(!items[0].is_removed());
        assert_eq!(items[0].last_modification_date(), at(100));
        assert_eq!(items[1].file_name(), "b.kml");
        assert!(items[1].is_removed());
    }

    #[tokio::test]
    async fn test_remote_file_is_reported_as_not_downloaded() {
        let (_dir, container) = container().await;
        container.add_remote_file("r.kml", b"remote", at(300)).await.unwrap();

        let items = parse(container.query("kml").await.unwrap());

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].file_name(), "r.kml");
        assert_eq!(items[0].file_url(), container.documents_path().join("r.kml"));
        assert!(!items[0].is_downloaded());
        assert_eq!(items[0].last_modification_date(), at(300));
    }

    #[tokio::test]
    async fn test_start_downloading_materializes_file() {
        let (_dir, container) = container().await;
        container.add_remote_file("r.kml", b"remote", at(300)).await.unwrap();
        let path = container.documents_path().join("r.kml");

        container.start_downloading(&path).await.unwrap();
        // Idempotent
        container.start_downloading(&path).await.unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "remote");
        let items = parse(container.query("kml").await.unwrap());
        assert_eq!(items.len(), 1);
        assert!(items[0].is_downloaded());
        assert_eq!(items[0].last_modification_date(), at(300));
    }

    #[tokio::test]
    async fn test_placeholder_error_maps_to_synchronization_error() {
        let (_dir, container) = container().await;
        container.add_remote_file("q.kml", b"remote", at(10)).await.unwrap();
        let path = placeholder_path(&container.documents_path(), "q.kml");
        let mut record = Placeholder::read(&path).unwrap();
        record.downloading_error = Some(StoredProviderError {
            code: 4355,
            description: "quota".into(),
        });
        record.write(&path).unwrap();

        let items = parse(container.query("kml").await.unwrap());

        assert_eq!(
            items[0].downloading_error(),
            Some(&SynchronizationError::FileNotUploadedDueToQuota)
        );
    }

    #[tokio::test]
    async fn test_versions_lifecycle() {
        let (_dir, container) = container().await;
        let path = container.documents_path().join("a.kml");
        write_file(&path, "current", 100);
        container.add_version("a.kml", b"old", at(50)).await.unwrap();
        container.add_version("a.kml", b"new", at(150)).await.unwrap();

        let items = parse(container.query("kml").await.unwrap());
        assert!(items[0].has_unresolved_conflicts());

        let versions = container.unresolved_versions(&path).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].modification_date, at(150));
        assert_eq!(fs::read_to_string(&versions[1].url).unwrap(), "new");

        container.resolve_versions(&path).await.unwrap();
        assert!(container.unresolved_versions(&path).await.unwrap().is_empty());
        let items = parse(container.query("kml").await.unwrap());
        assert!(!items[0].has_unresolved_conflicts());

        // Resolving twice is fine
        container.resolve_versions(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_trash_item_handles_not_downloaded_entries() {
        let (_dir, container) = container().await;
        container.add_remote_file("r.kml", b"remote", at(300)).await.unwrap();
        write_file(&container.documents_path().join("d.kml"), "local", 100);

        let documents = container.documents_path();
        assert!(container.trash_item(&documents.join("r.kml")).await.unwrap());
        assert!(container.trash_item(&documents.join("d.kml")).await.unwrap());
        assert!(!container.trash_item(&documents.join("r.kml")).await.unwrap());

        let items = parse(container.query("kml").await.unwrap());
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.is_removed()));
        assert_eq!(items[1].file_name(), "r.kml");
        assert_eq!(items[1].last_modification_date(), at(300));
        assert_eq!(fs::read_to_string(container.trash_path().join("r.kml")).unwrap(), "remote");
        assert!(!placeholder_path(&documents, "r.kml").exists());
    }

    #[test]
    fn test_entry_removed_after_listing_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("gone.kml"), "x").unwrap();
        let entries: Vec<fs::DirEntry> = fs::read_dir(dir.path())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        fs::remove_file(dir.path().join("gone.kml")).unwrap();

        assert_eq!(file_modified(&entries[0]).unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_survives_concurrent_renames() {
        let (_dir, container) = container().await;
        let documents = container.documents_path();
        let trash = container.trash_path();
        for i in 0..100 {
            write_file(&documents.join(format!("{i}.kml")), "x", 100);
        }

        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mover = {
            let stop = stop.clone();
            let (documents, trash) = (documents.clone(), trash.clone());
            std::thread::spawn(move || {
                let mut in_trash = false;
                while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                    let (from, to) = if in_trash {
                        (&trash, &documents)
                    } else {
                        (&documents, &trash)
                    };
                    for i in 0..100 {
                        let name = format!("{i}.kml");
                        let _ = fs::rename(from.join(&name), to.join(&name));
                    }
                    in_trash = !in_trash;
                }
            })
        };

        for _ in 0..200 {
            assert!(container.scan("kml").is_ok());
        }
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        mover.join().unwrap();
    }

    #[tokio::test]
    async fn test_start_downloading_without_remote_content_fails() {
        let (_dir, container) = container().await;
        Placeholder::new("x.kml", at(1))
            .write(&placeholder_path(&container.documents_path(), "x.kml"))
            .unwrap();
        let err = container
            .start_downloading(&container.documents_path().join("x.kml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("x.kml"));
    }
}
