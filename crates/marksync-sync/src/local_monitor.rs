//! Local bookmark directory monitor
//!
//! Enumerates the local directory once on start and reports the snapshot,
//! then watches the directory and reports added/updated/removed files after
//! each settled burst of changes. Only regular, non-hidden files with the
//! tracked extension are considered; subdirectories are ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use marksync_core::domain::{
    IncomingEvent, LocalContents, LocalMetadataItem, SynchronizationError,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::watcher::{ChangeEvent, DebouncedChangeQueue, DirectoryWatcher};
use crate::{MonitorEvent, MonitorState};

/// Lower bound for how often the debounce queue is polled
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Returns true for names the monitors track
pub fn is_tracked_file_name(file_name: &str, file_extension: &str) -> bool {
    !file_name.starts_with('.')
        && Path::new(file_name)
            .extension()
            .is_some_and(|ext| ext == file_extension)
}

/// Enumerates `directory` non-recursively
///
/// Entries that vanish or cannot be read while scanning are skipped.
///
/// # Errors
/// Returns [`SynchronizationError::FailedToRetrieveLocalDirectoryContent`]
/// if the directory itself cannot be listed.
pub fn scan_directory(
    directory: &Path,
    file_extension: &str,
) -> Result<LocalContents, SynchronizationError> {
    let entries = std::fs::read_dir(directory).map_err(|e| {
        error!(directory = %directory.display(), error = %e, "Cannot list local directory");
        SynchronizationError::FailedToRetrieveLocalDirectoryContent
    })?;

    let mut items = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let tracked = entry
            .file_name()
            .to_str()
            .is_some_and(|name| is_tracked_file_name(name, file_extension));
        if !tracked {
            continue;
        }
        match LocalMetadataItem::from_path(&entry.path()) {
            Ok(item) => items.push(item),
            Err(e) => debug!(error = %e, "Skipping local entry"),
        }
    }
    Ok(LocalContents::new(items))
}

async fn scan_directory_async(
    directory: PathBuf,
    file_extension: String,
) -> Result<LocalContents, SynchronizationError> {
    tokio::task::spawn_blocking(move || scan_directory(&directory, &file_extension))
        .await
        .map_err(|e| {
            error!(error = %e, "Local directory scan task failed");
            SynchronizationError::FailedToRetrieveLocalDirectoryContent
        })?
}

// ============================================================================
// LocalDirectoryMonitor
// ============================================================================

/// Watches the local bookmark directory
#[derive(Debug)]
pub struct LocalDirectoryMonitor {
    directory: PathBuf,
    file_extension: String,
    debounce_delay: Duration,
    state: watch::Sender<MonitorState>,
    cancel: Option<CancellationToken>,
}

impl LocalDirectoryMonitor {
    /// Creates a stopped monitor
    ///
    /// # Arguments
    /// * `directory` - Directory to watch; created on start if missing
    /// * `file_extension` - Tracked extension without the leading dot
    /// * `debounce_delay` - Quiet period before a burst of changes is rescanned
    pub fn new(
        directory: impl Into<PathBuf>,
        file_extension: impl Into<String>,
        debounce_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Stopped);
        Self {
            directory: directory.into(),
            file_extension: file_extension.into(),
            debounce_delay,
            state,
            cancel: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Gathers the directory contents and starts watching
    ///
    /// Sends exactly one `DidFinishGatheringLocalContents` per start. Calling
    /// this on a running monitor does nothing.
    ///
    /// # Errors
    /// - [`SynchronizationError::FailedToOpenLocalDirectoryFileDescriptor`] if
    ///   the directory cannot be created or watched
    /// - [`SynchronizationError::FailedToRetrieveLocalDirectoryContent`] if it
    ///   cannot be listed
    pub async fn start(
        &mut self,
        sender: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Result<(), SynchronizationError> {
        if self.state() != MonitorState::Stopped {
            debug!("Local directory monitor already running");
            return Ok(());
        }
        info!(directory = %self.directory.display(), "Starting local directory monitor");

        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || std::fs::create_dir_all(&directory))
            .await
            .map_err(|e| e.to_string())
            .and_then(|created| created.map_err(|e| e.to_string()))
            .map_err(|e| {
                error!(directory = %self.directory.display(), error = %e, "Cannot create local directory");
                SynchronizationError::FailedToOpenLocalDirectoryFileDescriptor
            })?;

        let contents =
            scan_directory_async(self.directory.clone(), self.file_extension.clone()).await?;

        let (mut watcher, change_rx) = DirectoryWatcher::new().map_err(|e| {
            error!(error = %e, "Cannot create local directory watcher");
            SynchronizationError::FailedToOpenLocalDirectoryFileDescriptor
        })?;
        watcher.watch(&self.directory).map_err(|e| {
            error!(error = %e, "Cannot watch local directory");
            SynchronizationError::FailedToOpenLocalDirectoryFileDescriptor
        })?;

        info!(count = contents.len(), "Gathered local contents");
        let gathered = IncomingEvent::DidFinishGatheringLocalContents(contents.clone());
        if sender.send(MonitorEvent::Contents(gathered)).is_err() {
            warn!("Event receiver dropped before local contents were delivered");
        }

        self.state.send_replace(MonitorState::Started);
        let cancel = CancellationToken::new();
        let task = LocalMonitorTask {
            directory: self.directory.clone(),
            file_extension: self.file_extension.clone(),
            contents,
            queue: DebouncedChangeQueue::new(self.debounce_delay),
            sender,
            watcher,
        };
        let poll_interval = (self.debounce_delay / 4).max(MIN_POLL_INTERVAL);
        tokio::spawn(task.run(change_rx, self.state.subscribe(), cancel.clone(), poll_interval));
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Stops watching and forgets the last scan
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            info!(directory = %self.directory.display(), "Stopping local directory monitor");
            cancel.cancel();
        }
        self.state.send_replace(MonitorState::Stopped);
    }

    /// Drops change notifications until [`resume`](Self::resume)
    pub fn pause(&mut self) {
        if self.state() == MonitorState::Started {
            debug!("Pausing local directory monitor");
            self.state.send_replace(MonitorState::Paused);
        }
    }

    /// Rescans and reports what changed while paused
    pub fn resume(&mut self) {
        if self.state() == MonitorState::Paused {
            debug!("Resuming local directory monitor");
            self.state.send_replace(MonitorState::Started);
        }
    }
}

impl Drop for LocalDirectoryMonitor {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Background task
// ============================================================================

struct LocalMonitorTask {
    directory: PathBuf,
    file_extension: String,
    contents: LocalContents,
    queue: DebouncedChangeQueue,
    sender: mpsc::UnboundedSender<MonitorEvent>,
    /// Kept alive for the lifetime of the task; dropping it stops the watch
    watcher: DirectoryWatcher,
}

impl LocalMonitorTask {
    async fn run(
        mut self,
        mut change_rx: mpsc::Receiver<ChangeEvent>,
        mut state_rx: watch::Receiver<MonitorState>,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) {
        let mut poll_timer = tokio::time::interval(poll_interval);
        let mut paused = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = change_rx.recv() => match event {
                    Some(change) => {
                        if !paused && change.touches_extension(&self.file_extension) {
                            self.queue.push(change);
                        }
                    }
                    None => {
                        warn!("Local change channel closed");
                        break;
                    }
                },

                _ = poll_timer.tick() => {
                    if !self.queue.poll().is_empty() && !self.rescan().await {
                        break;
                    }
                }

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    match state {
                        MonitorState::Paused => {
                            paused = true;
                            self.queue.clear();
                        }
                        MonitorState::Started => {
                            paused = false;
                            if !self.rescan().await {
                                break;
                            }
                        }
                        MonitorState::Stopped => break,
                    }
                }
            }
        }

        if let Err(e) = self.watcher.unwatch() {
            debug!(error = %e, "Unwatch on shutdown failed");
        }
        debug!(directory = %self.directory.display(), "Local monitor task finished");
    }

    /// Rescans and reports the delta; returns false if the task must stop
    async fn rescan(&mut self) -> bool {
        let current =
            match scan_directory_async(self.directory.clone(), self.file_extension.clone()).await {
                Ok(contents) => contents,
                Err(e) => {
                    let _ = self.sender.send(MonitorEvent::Failed(e));
                    return false;
                }
            };

        let update = self.contents.diff(&current);
        if update.is_empty() {
            return true;
        }
        info!(
            added = update.added.len(),
            updated = update.updated.len(),
            removed = update.removed.len(),
            "Local contents changed"
        );
        self.contents = current;
        self.sender
            .send(MonitorEvent::Contents(IncomingEvent::DidUpdateLocalContents(update)))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use marksync_core::domain::{ContentsUpdate, MetadataItem};
    use tempfile::TempDir;

    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(50);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("monitor event")
            .expect("channel open")
    }

    async fn next_update(
        rx: &mut mpsc::UnboundedReceiver<MonitorEvent>,
    ) -> ContentsUpdate<LocalMetadataItem> {
        match next_event(rx).await {
            MonitorEvent::Contents(IncomingEvent::DidUpdateLocalContents(update)) => update,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    #[test]
    fn test_is_tracked_file_name() {
        assert!(is_tracked_file_name("trip.kml", "kml"));
        assert!(!is_tracked_file_name("trip.kmz", "kml"));
        assert!(!is_tracked_file_name(".trip.kml", "kml"));
        assert!(!is_tracked_file_name("kml", "kml"));
    }

    #[test]
    fn test_scan_filters_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.kml"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join(".hidden.kml"), b"c").unwrap();
        std::fs::create_dir(dir.path().join("folder.kml")).unwrap();
        std::fs::write(dir.path().join("folder.kml").join("nested.kml"), b"d").unwrap();

        let contents = scan_directory(dir.path(), "kml").unwrap();
        let names: Vec<&str> = contents.iter().map(|i| i.file_name()).collect();
        assert_eq!(names, vec!["a.kml"]);
    }

    #[test]
    fn test_scan_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let result = scan_directory(&dir.path().join("missing"), "kml");
        assert_eq!(
            result,
            Err(SynchronizationError::FailedToRetrieveLocalDirectoryContent)
        );
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_creates_directory_and_gathers_once() {
        let root = TempDir::new().unwrap();
        let directory = root.path().join("bookmarks");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut monitor = LocalDirectoryMonitor::new(&directory, "kml", DEBOUNCE);
        monitor.start(tx.clone()).await.unwrap();
        monitor.start(tx).await.unwrap();

        assert!(directory.is_dir());
        assert_eq!(monitor.state(), MonitorState::Started);
        match next_event(&mut rx).await {
            MonitorEvent::Contents(IncomingEvent::DidFinishGatheringLocalContents(contents)) => {
                assert!(contents.is_empty())
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn test_reports_added_file() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = LocalDirectoryMonitor::new(dir.path(), "kml", DEBOUNCE);
        monitor.start(tx).await.unwrap();
        next_event(&mut rx).await;

        std::fs::write(dir.path().join("ignored.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("trip.kml"), b"<kml/>").unwrap();

        let update = next_update(&mut rx).await;
        assert_eq!(update.added.len(), 1);
        assert_eq!(update.added[0].file_name(), "trip.kml");
        monitor.stop();
    }

    #[tokio::test]
    async fn test_resume_reports_changes_made_while_paused() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.kml"), b"old").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = LocalDirectoryMonitor::new(dir.path(), "kml", DEBOUNCE);
        monitor.start(tx).await.unwrap();
        next_event(&mut rx).await;

        monitor.pause();
        assert_eq!(monitor.state(), MonitorState::Paused);
        std::fs::remove_file(dir.path().join("old.kml")).unwrap();
        std::fs::write(dir.path().join("new.kml"), b"new").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        monitor.resume();
        let update = next_update(&mut rx).await;
        assert_eq!(update.added.len(), 1);
        assert_eq!(update.added[0].file_name(), "new.kml");
        assert_eq!(update.removed.len(), 1);
        assert_eq!(update.removed[0].file_name(), "old.kml");
        monitor.stop();
    }
}
