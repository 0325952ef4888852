//! Synchronization manager
//!
//! Owns the lifecycle of one synchronization session: both directory
//! monitors, the event loop that drives the resolver and the writer, and
//! the observable [`SynchronizationManagerState`].
//!
//! ## Session lifecycle
//!
//! ```text
//! Stopped ──start()──→ Started ──pause()──→ Paused
//!    ↑                    │ ↑                  │
//!    └──stop() / error────┘ └────resume()──────┘
//! ```
//!
//! ## Error policy
//!
//! - transient errors are recorded in the state; the session keeps running
//! - account level errors stop the session but keep the setting enabled;
//!   [`SynchronizationManager::refresh_availability`] restarts it later
//! - fatal errors stop the session and disable the setting

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::Context;
use marksync_core::config::SyncConfig;
use marksync_core::domain::{ErrorSeverity, OutgoingEvent, SynchronizationError};
use marksync_core::ports::{IBookmarkModel, ICloudContainer, ISettingsStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cloud_monitor::CloudDirectoryMonitor;
use crate::coordination::{FileCoordinator, FLOCK_TIMEOUT};
use crate::local_monitor::LocalDirectoryMonitor;
use crate::namer;
use crate::resolver::SynchronizationStateResolver;
use crate::writer::{SynchronizationFileWriter, WriteOutcome, WriterDirectories};
use crate::{MonitorEvent, MonitorState};

// ============================================================================
// Options and state
// ============================================================================

/// Static parameters of the manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Local bookmarks directory
    pub local_directory: PathBuf,
    /// Tracked extension without the leading dot
    pub file_extension: String,
    /// Suffix for local copies kept on initial synchronization conflicts
    pub device_name: String,
    /// Quiet period for local change bursts
    pub debounce_delay: Duration,
    /// Delay between cloud container queries
    pub cloud_poll_interval: Duration,
    /// How long the writer waits for a file lock before proceeding
    pub lock_timeout: Duration,
}

impl ManagerOptions {
    /// Builds options from the `sync` configuration section
    ///
    /// The device name falls back to the host name.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            local_directory: config.local_dir.clone(),
            file_extension: config.file_extension.clone(),
            device_name: config
                .device_name
                .clone()
                .unwrap_or_else(namer::device_name),
            debounce_delay: Duration::from_millis(config.debounce_ms),
            cloud_poll_interval: Duration::from_millis(config.cloud_poll_interval_ms),
            lock_timeout: FLOCK_TIMEOUT,
        }
    }
}

/// Snapshot delivered to observers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynchronizationManagerState {
    /// Whether the cloud container can be used
    pub is_available: bool,
    /// Whether a synchronization session is running
    pub is_on: bool,
    /// Last error; check `is_fatal()` to offer a bug report
    pub error: Option<SynchronizationError>,
}

type StateCallback = Arc<dyn Fn(&SynchronizationManagerState) + Send + Sync>;

struct Observer {
    owner: Weak<dyn Any + Send + Sync>,
    callback: StateCallback,
}

impl Observer {
    fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }

    fn is_owned_by(&self, owner: *const ()) -> bool {
        self.owner.as_ptr() as *const () == owner
    }
}

// ============================================================================
// Session
// ============================================================================

struct Session {
    id: u64,
    state: MonitorState,
    local: LocalDirectoryMonitor,
    cloud: CloudDirectoryMonitor,
    sender: mpsc::UnboundedSender<MonitorEvent>,
    cancel: CancellationToken,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.local.stop();
        self.cloud.stop();
    }
}

// ============================================================================
// SynchronizationManager
// ============================================================================

/// Runs bookmark synchronization between the local directory and the cloud
pub struct SynchronizationManager {
    options: ManagerOptions,
    container: Arc<dyn ICloudContainer>,
    settings: Arc<dyn ISettingsStore>,
    bookmark_model: Arc<dyn IBookmarkModel>,
    session: tokio::sync::Mutex<Option<Session>>,
    next_session_id: AtomicU64,
    stopped_for_account_error: AtomicBool,
    state: Mutex<SynchronizationManagerState>,
    observers: Mutex<Vec<Observer>>,
    weak_self: Weak<SynchronizationManager>,
}

impl SynchronizationManager {
    /// Creates a stopped manager
    ///
    /// # Arguments
    /// * `options` - Directories, extension and timings
    /// * `container` - Cloud container to synchronize with
    /// * `settings` - Persisted enable and initial synchronization flags
    /// * `bookmark_model` - Receives reload and delete requests
    pub fn new(
        options: ManagerOptions,
        container: Arc<dyn ICloudContainer>,
        settings: Arc<dyn ISettingsStore>,
        bookmark_model: Arc<dyn IBookmarkModel>,
    ) -> Arc<Self> {
        let state = SynchronizationManagerState {
            is_available: container.is_available(),
            is_on: false,
            error: None,
        };
        Arc::new_cyclic(|weak_self| Self {
            options,
            container,
            settings,
            bookmark_model,
            session: tokio::sync::Mutex::new(None),
            next_session_id: AtomicU64::new(0),
            stopped_for_account_error: AtomicBool::new(false),
            state: Mutex::new(state),
            observers: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Returns the current observable state
    pub fn state(&self) -> SynchronizationManagerState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the lifecycle state of the current session
    pub async fn monitor_state(&self) -> MonitorState {
        self.session
            .lock()
            .await
            .as_ref()
            .map_or(MonitorState::Stopped, |session| session.state)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Starts a synchronization session
    ///
    /// Does nothing if synchronization is disabled in the settings or a
    /// session is already running. The error is also applied to the state
    /// following the error policy.
    ///
    /// # Errors
    /// - [`SynchronizationError::ICloudIsNotAvailable`] if the container is
    ///   unavailable
    /// - any error raised while starting the monitors
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SynchronizationError> {
        if !self.settings.is_cloud_sync_enabled() {
            debug!("Cloud synchronization disabled, not starting");
            return Ok(());
        }

        let result = {
            let mut session = self.session.lock().await;
            if session.is_some() {
                debug!("Synchronization already running");
                return Ok(());
            }
            self.open_session().await.map(|opened| {
                *session = Some(opened);
            })
        };

        match result {
            Ok(()) => {
                self.stopped_for_account_error.store(false, Ordering::SeqCst);
                self.update_state(|state| {
                    state.is_available = true;
                    state.is_on = true;
                    state.error = None;
                });
                info!("Synchronization started");
                Ok(())
            }
            Err(error) => {
                self.handle_error(None, error.clone()).await;
                Err(error)
            }
        }
    }

    /// Stops the running session
    ///
    /// Writes already in flight finish; their results are discarded.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let closed = self.session.lock().await.take();
        let was_running = closed.is_some();
        drop(closed);

        self.update_state(|state| {
            state.is_on = false;
            if was_running {
                state.error = None;
            }
        });
        if was_running {
            info!("Synchronization stopped");
        }
    }

    /// Suspends synchronization while the application is in the background
    ///
    /// The cloud monitor pauses and keeps its snapshot. The local monitor
    /// stops completely.
    pub async fn pause(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.state == MonitorState::Started {
                session.cloud.pause();
                session.local.stop();
                session.state = MonitorState::Paused;
                info!("Synchronization paused");
            }
        }
    }

    /// Resumes a paused session
    ///
    /// The local monitor restarts and regathers, so local changes made in
    /// the meantime are picked up.
    ///
    /// # Errors
    /// Returns the local monitor's start error; the session is then stopped
    /// following the error policy.
    pub async fn resume(&self) -> Result<(), SynchronizationError> {
        let result = {
            let mut guard = self.session.lock().await;
            match guard.as_mut() {
                Some(session) if session.state == MonitorState::Paused => {
                    session.cloud.resume();
                    let started = session.local.start(session.sender.clone()).await;
                    if started.is_ok() {
                        session.state = MonitorState::Started;
                        info!("Synchronization resumed");
                    }
                    started
                }
                _ => Ok(()),
            }
        };

        if let Err(error) = &result {
            self.handle_error(None, error.clone()).await;
        }
        result
    }

    /// Enables or disables synchronization and persists the choice
    ///
    /// Enabling forgets that an initial synchronization happened, so the
    /// next session preserves both sides on conflict.
    ///
    /// # Errors
    /// Returns an error if the settings cannot be persisted. Start failures
    /// are reported through the state instead.
    #[instrument(skip(self))]
    pub async fn set_sync_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        if enabled {
            self.settings
                .set_initial_synchronization_completed(false)
                .context("Failed to reset initial synchronization flag")?;
            self.settings
                .set_cloud_sync_enabled(true)
                .context("Failed to enable cloud synchronization")?;
            if let Err(e) = self.start().await {
                warn!(error = %e, "Synchronization enabled but not started");
            }
        } else {
            self.settings
                .set_cloud_sync_enabled(false)
                .context("Failed to disable cloud synchronization")?;
            self.stop().await;
        }
        Ok(())
    }

    /// Follows changes of the enabled setting until `cancel` fires
    pub fn spawn_settings_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut receiver = self.settings.subscribe();
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = receiver.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let enabled = *receiver.borrow_and_update();
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                debug!(enabled, "Cloud synchronization setting changed");
                if enabled {
                    // Failures are recorded in the state
                    let _ = manager.start().await;
                } else {
                    manager.stop().await;
                }
            }
            debug!("Settings listener finished");
        })
    }

    /// Re-checks whether the cloud container is usable
    ///
    /// Restarts a session that was stopped because the account or container
    /// went away. Stops the running session if the container is gone now.
    pub async fn refresh_availability(&self) {
        let available = self.container.is_available();
        let running = self.session.lock().await.is_some();

        if available {
            if !running
                && self.stopped_for_account_error.load(Ordering::SeqCst)
                && self.settings.is_cloud_sync_enabled()
            {
                info!("Cloud container available again, restarting synchronization");
                let _ = self.start().await;
            } else {
                self.update_state(|state| state.is_available = true);
            }
        } else if running {
            self.handle_error(None, SynchronizationError::ICloudIsNotAvailable)
                .await;
        } else {
            self.update_state(|state| state.is_available = false);
        }
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Registers `callback` for state changes while `owner` is alive
    ///
    /// The callback receives the current state immediately.
    pub fn add_observer<O, F>(&self, owner: &Arc<O>, callback: F)
    where
        O: Send + Sync + 'static,
        F: Fn(&SynchronizationManagerState) + Send + Sync + 'static,
    {
        let erased: Arc<dyn Any + Send + Sync> = owner.clone();
        let callback: StateCallback = Arc::new(callback);
        {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.retain(Observer::is_alive);
            observers.push(Observer {
                owner: Arc::downgrade(&erased),
                callback: Arc::clone(&callback),
            });
        }
        callback(&self.state());
    }

    /// Unregisters every callback registered for `owner`
    pub fn remove_observer<O: Send + Sync + 'static>(&self, owner: &Arc<O>) {
        let owner = Arc::as_ptr(owner) as *const ();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|observer| observer.is_alive() && !observer.is_owned_by(owner));
    }

    /// Number of observers whose owner is still alive
    pub fn observer_count(&self) -> usize {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(Observer::is_alive);
        observers.len()
    }

    fn update_state(&self, change: impl FnOnce(&mut SynchronizationManagerState)) {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let before = state.clone();
            change(&mut state);
            if *state == before {
                return;
            }
            state.clone()
        };
        debug!(
            is_available = snapshot.is_available,
            is_on = snapshot.is_on,
            error = ?snapshot.error,
            "Synchronization state changed"
        );

        let callbacks: Vec<StateCallback> = {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.retain(Observer::is_alive);
            observers.iter().map(|o| Arc::clone(&o.callback)).collect()
        };
        for callback in callbacks {
            callback(&snapshot);
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn open_session(&self) -> Result<Session, SynchronizationError> {
        if !self.container.is_available() {
            return Err(SynchronizationError::ICloudIsNotAvailable);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut cloud = CloudDirectoryMonitor::new(
            Arc::clone(&self.container),
            self.options.file_extension.clone(),
            self.options.cloud_poll_interval,
        );
        cloud.start(sender.clone()).await?;

        let directories = match self.resolve_directories().await {
            Ok(directories) => directories,
            Err(e) => {
                cloud.stop();
                return Err(e);
            }
        };

        let mut local = LocalDirectoryMonitor::new(
            self.options.local_directory.clone(),
            self.options.file_extension.clone(),
            self.options.debounce_delay,
        );
        if let Err(e) = local.start(sender.clone()).await {
            cloud.stop();
            return Err(e);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let is_initial = !self.settings.initial_synchronization_completed();
        let cancel = CancellationToken::new();
        let writer = SynchronizationFileWriter::new(
            Arc::clone(&self.container),
            directories,
            self.options.device_name.clone(),
        )
        .with_coordinator(FileCoordinator::new(self.options.lock_timeout));

        let event_loop = EventLoop {
            session_id: id,
            resolver: SynchronizationStateResolver::new(is_initial),
            writer,
            manager: self.weak_self.clone(),
            bookmark_model: Arc::clone(&self.bookmark_model),
            settings: Arc::clone(&self.settings),
            cancel: cancel.clone(),
        };
        tokio::spawn(event_loop.run(receiver));
        info!(session = id, is_initial, "Synchronization session opened");

        Ok(Session {
            id,
            state: MonitorState::Started,
            local,
            cloud,
            sender,
            cancel,
        })
    }

    async fn resolve_directories(&self) -> Result<WriterDirectories, SynchronizationError> {
        let cloud = self.container.resolve_documents_dir().await.map_err(|e| {
            error!(error = %e, "Cannot resolve cloud documents directory");
            SynchronizationError::ContainerNotFound
        })?;
        let trash = self.container.trash_dir().await.map_err(|e| {
            error!(error = %e, "Cannot resolve cloud trash directory");
            SynchronizationError::ContainerNotFound
        })?;
        Ok(WriterDirectories {
            local: self.options.local_directory.clone(),
            cloud,
            trash,
        })
    }

    /// Applies the error policy
    ///
    /// Errors tagged with a session id are ignored once that session is
    /// gone.
    async fn handle_error(&self, session_id: Option<u64>, error: SynchronizationError) {
        let severity = error.severity();
        {
            let mut guard = self.session.lock().await;
            if let Some(id) = session_id {
                if guard.as_ref().map(|session| session.id) != Some(id) {
                    debug!(session = id, error = %error, "Ignoring error of a closed session");
                    return;
                }
            }
            if severity != ErrorSeverity::Transient {
                drop(guard.take());
            }
        }

        match severity {
            ErrorSeverity::Transient => {
                warn!(error = %error, "Synchronization error");
                self.update_state(|state| state.error = Some(error));
            }
            ErrorSeverity::AccountLevel => {
                warn!(error = %error, "Cloud container unavailable, synchronization stopped");
                self.stopped_for_account_error.store(true, Ordering::SeqCst);
                self.update_state(|state| {
                    state.is_available = false;
                    state.is_on = false;
                    state.error = Some(error);
                });
            }
            ErrorSeverity::Fatal => {
                error!(error = %error, "Fatal synchronization error, disabling synchronization");
                self.stopped_for_account_error.store(false, Ordering::SeqCst);
                if let Err(e) = self.settings.set_cloud_sync_enabled(false) {
                    error!(error = %e, "Failed to disable cloud synchronization");
                }
                self.update_state(|state| {
                    state.is_on = false;
                    state.error = Some(error);
                });
            }
        }
    }
}

impl std::fmt::Debug for SynchronizationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizationManager")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Event loop
// ============================================================================

/// Single task that owns the resolver and the writer of one session
struct EventLoop {
    session_id: u64,
    resolver: SynchronizationStateResolver,
    writer: SynchronizationFileWriter,
    manager: Weak<SynchronizationManager>,
    bookmark_model: Arc<dyn IBookmarkModel>,
    settings: Arc<dyn ISettingsStore>,
    cancel: CancellationToken,
}

impl EventLoop {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<MonitorEvent>) {
        debug!(session = self.session_id, "Event loop started");

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                MonitorEvent::Failed(error) => {
                    let stops_session = error.severity() != ErrorSeverity::Transient;
                    self.report(error).await;
                    if stops_session {
                        break;
                    }
                }
                MonitorEvent::Contents(event) => {
                    for action in self.resolver.resolve_event(event) {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        self.execute(action).await;
                    }
                }
            }
        }

        debug!(session = self.session_id, "Event loop finished");
    }

    async fn execute(&mut self, action: OutgoingEvent) {
        match action {
            OutgoingEvent::DidFinishInitialSynchronization => {
                match self.settings.set_initial_synchronization_completed(true) {
                    Ok(()) => info!("Initial synchronization completed"),
                    Err(e) => warn!(error = %e, "Failed to persist initial synchronization flag"),
                }
            }
            OutgoingEvent::DidReceiveError(error) => self.report(error).await,
            action => {
                let result = self.writer.write(&action).await;
                if self.cancel.is_cancelled() {
                    debug!(kind = action.kind(), "Discarding result of a stopped session");
                    return;
                }
                match result {
                    Ok(WriteOutcome::Success) => {}
                    Ok(WriteOutcome::Reload(paths)) => {
                        for path in &paths {
                            self.bookmark_model.reload_category(path);
                        }
                    }
                    Ok(WriteOutcome::Delete(paths)) => {
                        for path in &paths {
                            self.bookmark_model.delete_category(path);
                        }
                    }
                    Err(e) => {
                        warn!(kind = action.kind(), file = ?action.file_name(), error = %e, "Write failed");
                        self.report(e.into()).await;
                    }
                }
            }
        }
    }

    async fn report(&self, error: SynchronizationError) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_error(Some(self.session_id), error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Instant, SystemTime};

    use marksync_core::domain::CloudItemAttributes;
    use marksync_core::ports::{CloudQueryResult, FileVersion, InMemorySettingsStore};
    use tempfile::TempDir;

    use super::*;

    struct DirContainer {
        available: AtomicBool,
        documents: PathBuf,
        trash: PathBuf,
    }

    #[async_trait::async_trait]
    impl ICloudContainer for DirContainer {
        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn resolve_documents_dir(&self) -> anyhow::Result<PathBuf> {
            Ok(self.documents.clone())
        }

        async fn trash_dir(&self) -> anyhow::Result<PathBuf> {
            Ok(self.trash.clone())
        }

        async fn query(&self, extension: &str) -> anyhow::Result<CloudQueryResult> {
            let mut items = Vec::new();
            for entry in fs::read_dir(&self.documents)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                    continue;
                }
                items.push(CloudItemAttributes {
                    content_change_date: Some(fs::metadata(&path)?.modified()?),
                    url: Some(path),
                    is_downloaded: Some(true),
                    ..Default::default()
                });
            }
            Ok(CloudQueryResult { items })
        }

        async fn start_downloading(&self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        async fn trash_item(&self, _path: &Path) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn unresolved_versions(&self, _path: &Path) -> anyhow::Result<Vec<FileVersion>> {
            Ok(Vec::new())
        }

        async fn resolve_versions(&self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingModel {
        reloaded: Mutex<Vec<PathBuf>>,
        deleted: Mutex<Vec<PathBuf>>,
    }

    impl IBookmarkModel for RecordingModel {
        fn reload_category(&self, path: &Path) {
            self.reloaded.lock().unwrap().push(path.to_path_buf());
        }

        fn delete_category(&self, path: &Path) {
            self.deleted.lock().unwrap().push(path.to_path_buf());
        }
    }

    struct Fixture {
        root: TempDir,
        container: Arc<DirContainer>,
        settings: Arc<InMemorySettingsStore>,
        model: Arc<RecordingModel>,
        manager: Arc<SynchronizationManager>,
    }

    impl Fixture {
        fn new(enabled: bool) -> Self {
            let root = TempDir::new().unwrap();
            let documents = root.path().join("cloud/Documents");
            fs::create_dir_all(&documents).unwrap();
            let container = Arc::new(DirContainer {
                available: AtomicBool::new(true),
                documents,
                trash: root.path().join("cloud/.Trash"),
            });
            let settings = Arc::new(InMemorySettingsStore::new(enabled));
            let model = Arc::new(RecordingModel::default());
            let options = ManagerOptions {
                local_directory: root.path().join("local"),
                file_extension: "kml".to_string(),
                device_name: "laptop".to_string(),
                debounce_delay: Duration::from_millis(50),
                cloud_poll_interval: Duration::from_millis(50),
                lock_timeout: Duration::from_millis(100),
            };
            let manager = SynchronizationManager::new(
                options,
                container.clone(),
                settings.clone(),
                model.clone(),
            );
            Self {
                root,
                container,
                settings,
                model,
                manager,
            }
        }

        fn local(&self, name: &str) -> PathBuf {
            self.root.path().join("local").join(name)
        }

        fn cloud(&self, name: &str) -> PathBuf {
            self.container.documents.join(name)
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_observer_receives_current_state_immediately() {
        let fx = Fixture::new(false);
        let owner = Arc::new(());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        fx.manager.add_observer(&owner, move |state| {
            assert!(state.is_available);
            assert!(!state.is_on);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.manager.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_and_removed_observers_are_pruned() {
        let fx = Fixture::new(false);
        let kept = Arc::new(1u8);
        let dropped = Arc::new(2u8);
        fx.manager.add_observer(&kept, |_| {});
        fx.manager.add_observer(&dropped, |_| {});
        assert_eq!(fx.manager.observer_count(), 2);

        drop(dropped);
        assert_eq!(fx.manager.observer_count(), 1);

        fx.manager.remove_observer(&kept);
        assert_eq!(fx.manager.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_start_is_noop_when_disabled() {
        let fx = Fixture::new(false);
        fx.manager.start().await.unwrap();
        assert_eq!(fx.manager.monitor_state().await, MonitorState::Stopped);
        assert!(!fx.manager.state().is_on);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let fx = Fixture::new(true);
        let states = Arc::new(Mutex::new(Vec::new()));
        let owner = Arc::new(());
        let recorded = states.clone();
        fx.manager
            .add_observer(&owner, move |state| recorded.lock().unwrap().push(state.is_on));

        fx.manager.start().await.unwrap();
        assert_eq!(fx.manager.monitor_state().await, MonitorState::Started);
        assert!(fx.manager.state().is_on);

        // Starting twice keeps the same session
        fx.manager.start().await.unwrap();

        fx.manager.stop().await;
        assert_eq!(fx.manager.monitor_state().await, MonitorState::Stopped);
        assert_eq!(*states.lock().unwrap(), vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let fx = Fixture::new(true);
        fx.manager.start().await.unwrap();

        fx.manager.pause().await;
        assert_eq!(fx.manager.monitor_state().await, MonitorState::Paused);
        assert!(fx.manager.state().is_on);

        fx.manager.resume().await.unwrap();
        assert_eq!(fx.manager.monitor_state().await, MonitorState::Started);
        fx.manager.stop().await;
    }

    #[tokio::test]
    async fn test_unavailable_container_stops_but_keeps_setting() {
        let fx = Fixture::new(true);
        fx.container.available.store(false, Ordering::SeqCst);

        let err = fx.manager.start().await.unwrap_err();

        assert_eq!(err, SynchronizationError::ICloudIsNotAvailable);
        let state = fx.manager.state();
        assert!(!state.is_available);
        assert!(!state.is_on);
        assert_eq!(state.error, Some(SynchronizationError::ICloudIsNotAvailable));
        assert!(fx.settings.is_cloud_sync_enabled());
    }

    #[tokio::test]
    async fn test_refresh_availability_restarts_after_account_error() {
        let fx = Fixture::new(true);
        fx.container.available.store(false, Ordering::SeqCst);
        let _ = fx.manager.start().await;

        fx.manager.refresh_availability().await;
        assert!(!fx.manager.state().is_on);

        fx.container.available.store(true, Ordering::SeqCst);
        fx.manager.refresh_availability().await;

        let state = fx.manager.state();
        assert!(state.is_available);
        assert!(state.is_on);
        assert_eq!(state.error, None);
        fx.manager.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_availability_stops_running_session() {
        let fx = Fixture::new(true);
        fx.manager.start().await.unwrap();

        fx.container.available.store(false, Ordering::SeqCst);
        fx.manager.refresh_availability().await;

        assert_eq!(fx.manager.monitor_state().await, MonitorState::Stopped);
        assert!(!fx.manager.state().is_available);
        assert!(fx.settings.is_cloud_sync_enabled());
    }

    #[tokio::test]
    async fn test_fatal_error_disables_synchronization() {
        let fx = Fixture::new(true);
        // A regular file where the local directory should be
        fs::write(fx.root.path().join("local"), "not a directory").unwrap();

        let err = fx.manager.start().await.unwrap_err();

        assert_eq!(err, SynchronizationError::FailedToOpenLocalDirectoryFileDescriptor);
        assert!(err.is_fatal());
        assert!(!fx.settings.is_cloud_sync_enabled());
        let state = fx.manager.state();
        assert!(!state.is_on);
        assert!(state.error.is_some_and(|e| e.is_fatal()));
        assert_eq!(fx.manager.monitor_state().await, MonitorState::Stopped);
    }

    #[tokio::test]
    async fn test_set_sync_enabled_resets_initial_flag() {
        let fx = Fixture::new(false);
        fx.settings.set_initial_synchronization_completed(true).unwrap();

        fx.manager.set_sync_enabled(true).await.unwrap();
        assert!(fx.settings.is_cloud_sync_enabled());
        assert!(fx.manager.state().is_on);

        fx.manager.set_sync_enabled(false).await.unwrap();
        assert!(!fx.settings.is_cloud_sync_enabled());
        assert!(!fx.manager.state().is_on);
    }

    #[tokio::test]
    async fn test_settings_listener_follows_setting() {
        let fx = Fixture::new(false);
        let cancel = CancellationToken::new();
        let listener = fx.manager.spawn_settings_listener(cancel.clone());

        fx.settings.set_cloud_sync_enabled(true).unwrap();
        let manager = fx.manager.clone();
        eventually(move || manager.state().is_on).await;

        fx.settings.set_cloud_sync_enabled(false).unwrap();
        let manager = fx.manager.clone();
        eventually(move || !manager.state().is_on).await;

        cancel.cancel();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_synchronization_merges_both_sides() {
        let fx = Fixture::new(true);
        fs::create_dir_all(fx.local("")).unwrap();
        fs::write(fx.local("mine.kml"), "mine").unwrap();
        set_mtime(&fx.local("mine.kml"), 1_700_000_000);
        fs::write(fx.cloud("theirs.kml"), "theirs").unwrap();
        set_mtime(&fx.cloud("theirs.kml"), 1_700_000_100);

        fx.manager.start().await.unwrap();

        let settings = fx.settings.clone();
        eventually(move || settings.initial_synchronization_completed()).await;
        assert_eq!(fs::read_to_string(fx.cloud("mine.kml")).unwrap(), "mine");
        assert_eq!(fs::read_to_string(fx.local("theirs.kml")).unwrap(), "theirs");
        assert_eq!(*fx.model.reloaded.lock().unwrap(), vec![fx.local("theirs.kml")]);
        fx.manager.stop().await;
    }
}
