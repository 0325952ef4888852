//! Directory watching and debounced change queue
//!
//! [`DirectoryWatcher`] wraps a `notify` watcher on a single directory
//! (non-recursive) and forwards [`ChangeEvent`]s through an mpsc channel.
//! [`DebouncedChangeQueue`] holds events back until a path has been quiet
//! for the debounce window, so a burst of writes to one bookmark file
//! produces a single rescan.
//!
//! ```text
//! inotify / kqueue
//!       │
//!       ▼
//!  DirectoryWatcher ──→ mpsc::channel ──→ DebouncedChangeQueue ──→ LocalDirectoryMonitor
//! ```

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the channel between the notify thread and the monitor
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// ChangeEvent
// ============================================================================

/// A filesystem change inside the watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { old: PathBuf, new: PathBuf },
}

impl ChangeEvent {
    /// Returns the primary path associated with this event
    ///
    /// For rename events, this returns the new (destination) path.
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }

    /// Returns true if any path of the event has the given extension
    pub fn touches_extension(&self, extension: &str) -> bool {
        let matches = |path: &Path| path.extension() == Some(OsStr::new(extension));
        match self {
            ChangeEvent::Renamed { old, new } => matches(old) || matches(new),
            other => matches(other.path()),
        }
    }
}

// ============================================================================
// DirectoryWatcher
// ============================================================================

/// Watches one directory using the OS-native mechanism
///
/// Dropping the watcher stops watching.
pub struct DirectoryWatcher {
    watcher: RecommendedWatcher,
    watched: Option<PathBuf>,
}

impl DirectoryWatcher {
    /// Creates a watcher and the receiver its events are delivered to
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (event_tx, event_rx) = mpsc::channel::<ChangeEvent>(EVENT_CHANNEL_CAPACITY);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(e) = event_tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send change event (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "Directory watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create directory watcher")?;

        Ok((
            Self {
                watcher,
                watched: None,
            },
            event_rx,
        ))
    }

    /// Starts watching `path` without descending into subdirectories
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (missing directory,
    /// insufficient permissions, or the inotify watch limit is reached)
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Starting directory watch");
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))?;
        self.watched = Some(path.to_path_buf());
        Ok(())
    }

    /// Stops watching the current directory, if any
    pub fn unwatch(&mut self) -> Result<()> {
        if let Some(path) = self.watched.take() {
            info!(path = %path.display(), "Stopping directory watch");
            self.watcher
                .unwatch(&path)
                .with_context(|| format!("Failed to unwatch path: {}", path.display()))?;
        }
        Ok(())
    }

    pub fn watched_path(&self) -> Option<&Path> {
        self.watched.as_deref()
    }
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("watched", &self.watched)
            .finish()
    }
}

// ============================================================================
// notify::Event → ChangeEvent
// ============================================================================

/// Converts a `notify::Event` into a [`ChangeEvent`]
///
/// Access events and events without paths are ignored. A rename carrying a
/// single path is reported as a modification of that path.
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(_) => Some(ChangeEvent::Created(paths.first()?.clone())),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            Some(ChangeEvent::Renamed {
                old: paths[0].clone(),
                new: paths[1].clone(),
            })
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(ChangeEvent::Deleted(paths.first()?.clone()))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Some(ChangeEvent::Created(paths.first()?.clone()))
        }
        EventKind::Modify(_) => Some(ChangeEvent::Modified(paths.first()?.clone())),
        EventKind::Remove(_) => Some(ChangeEvent::Deleted(paths.first()?.clone())),
        _ => {
            trace!(kind = ?event.kind, "Ignoring event kind");
            None
        }
    }
}

// ============================================================================
// DebouncedChangeQueue
// ============================================================================

/// Queue that coalesces rapid filesystem changes
///
/// Each path keeps only its latest event. The event is released by
/// [`poll`](DebouncedChangeQueue::poll) once the path has been quiet for
/// the debounce delay.
#[derive(Debug)]
pub struct DebouncedChangeQueue {
    pending: HashMap<PathBuf, (ChangeEvent, Instant)>,
    debounce_delay: Duration,
}

impl DebouncedChangeQueue {
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
        }
    }

    /// Inserts or replaces the pending event for the event's path
    ///
    /// Replacing an event restarts the debounce window for that path.
    pub fn push(&mut self, event: ChangeEvent) {
        let path = event.path().to_path_buf();
        debug!(path = %path.display(), event = ?event, "Enqueuing change event");
        self.pending.insert(path, (event, Instant::now()));
    }

    /// Removes and returns every event that has been quiet long enough
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let delay = self.debounce_delay;
        let settled_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, timestamp))| now.duration_since(*timestamp) >= delay)
            .map(|(path, _)| path.clone())
            .collect();

        let settled: Vec<ChangeEvent> = settled_paths
            .iter()
            .filter_map(|path| self.pending.remove(path).map(|(event, _)| event))
            .collect();

        if !settled.is_empty() {
            debug!(count = settled.len(), "Polled settled change events");
        }
        settled
    }

    /// Drops every pending event
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_event(kind: EventKind, paths: &[&str]) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    // ------------------------------------------------------------------
    // ChangeEvent
    // ------------------------------------------------------------------

    #[test]
    fn test_rename_path_is_destination() {
        let event = ChangeEvent::Renamed {
            old: PathBuf::from("/b/old.kml"),
            new: PathBuf::from("/b/new.kml"),
        };
        assert_eq!(event.path(), Path::new("/b/new.kml"));
    }

    #[test]
    fn test_touches_extension() {
        assert!(ChangeEvent::Created(PathBuf::from("/b/a.kml")).touches_extension("kml"));
        assert!(!ChangeEvent::Created(PathBuf::from("/b/a.txt")).touches_extension("kml"));
        assert!(!ChangeEvent::Created(PathBuf::from("/b/kml")).touches_extension("kml"));

        let rename_out = ChangeEvent::Renamed {
            old: PathBuf::from("/b/a.kml"),
            new: PathBuf::from("/b/a.bak"),
        };
        assert!(rename_out.touches_extension("kml"));
    }

    // ------------------------------------------------------------------
    // DebouncedChangeQueue
    // ------------------------------------------------------------------

    #[test]
    fn test_push_coalesces_same_path() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(100));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.kml")));
        queue.push(ChangeEvent::Modified(PathBuf::from("/a.kml")));
        queue.push(ChangeEvent::Modified(PathBuf::from("/b.kml")));
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn test_poll_keeps_latest_event() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.kml")));
        queue.push(ChangeEvent::Deleted(PathBuf::from("/a.kml")));

        std::thread::sleep(Duration::from_millis(10));
        let settled = queue.poll();
        assert_eq!(settled, vec![ChangeEvent::Deleted(PathBuf::from("/a.kml"))]);
        assert!(queue.is_empty());
        assert!(queue.poll().is_empty());
    }

    #[test]
    fn test_poll_holds_recent_events() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(60));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.kml")));
        assert!(queue.poll().is_empty());
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_coalescing_restarts_window() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.kml")));
        std::thread::sleep(Duration::from_millis(30));
        queue.push(ChangeEvent::Modified(PathBuf::from("/a.kml")));
        std::thread::sleep(Duration::from_millis(30));
        assert!(queue.poll().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(
            queue.poll(),
            vec![ChangeEvent::Modified(PathBuf::from("/a.kml"))]
        );
    }

    #[test]
    fn test_clear() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.kml")));
        queue.clear();
        assert!(queue.is_empty());
    }

    // ------------------------------------------------------------------
    // Event mapping
    // ------------------------------------------------------------------

    #[test]
    fn test_map_create_and_remove() {
        let created = notify_event(
            EventKind::Create(notify::event::CreateKind::File),
            &["/b/a.kml"],
        );
        assert_eq!(
            map_notify_event(&created),
            Some(ChangeEvent::Created(PathBuf::from("/b/a.kml")))
        );

        let removed = notify_event(
            EventKind::Remove(notify::event::RemoveKind::File),
            &["/b/a.kml"],
        );
        assert_eq!(
            map_notify_event(&removed),
            Some(ChangeEvent::Deleted(PathBuf::from("/b/a.kml")))
        );
    }

    #[test]
    fn test_map_renames() {
        let both = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/b/.tmp", "/b/a.kml"],
        );
        assert_eq!(
            map_notify_event(&both),
            Some(ChangeEvent::Renamed {
                old: PathBuf::from("/b/.tmp"),
                new: PathBuf::from("/b/a.kml"),
            })
        );

        let to = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/b/a.kml"],
        );
        assert_eq!(
            map_notify_event(&to),
            Some(ChangeEvent::Created(PathBuf::from("/b/a.kml")))
        );

        let from = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/b/a.kml"],
        );
        assert_eq!(
            map_notify_event(&from),
            Some(ChangeEvent::Deleted(PathBuf::from("/b/a.kml")))
        );

        let single = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/b/a.kml"],
        );
        assert_eq!(
            map_notify_event(&single),
            Some(ChangeEvent::Modified(PathBuf::from("/b/a.kml")))
        );
    }

    #[test]
    fn test_map_ignores_access_and_empty_events() {
        let access = notify_event(
            EventKind::Access(notify::event::AccessKind::Read),
            &["/b/a.kml"],
        );
        assert!(map_notify_event(&access).is_none());

        let empty = notify_event(EventKind::Create(notify::event::CreateKind::File), &[]);
        assert!(map_notify_event(&empty).is_none());
    }

    // ------------------------------------------------------------------
    // DirectoryWatcher
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_watch_missing_directory_fails() {
        let (mut watcher, _rx) = DirectoryWatcher::new().unwrap();
        let result = watcher.watch(Path::new("/nonexistent/marksync/dir"));
        assert!(result.is_err());
        assert!(watcher.watched_path().is_none());
    }

    #[tokio::test]
    async fn test_watch_reports_created_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut watcher, mut rx) = DirectoryWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();

        let path = dir.path().join("a.kml");
        std::fs::write(&path, b"<kml/>").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher event")
            .expect("channel open");
        assert!(event.touches_extension("kml"));
        watcher.unwatch().unwrap();
    }
}
