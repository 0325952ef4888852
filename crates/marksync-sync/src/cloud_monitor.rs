//! Cloud container monitor
//!
//! Resolves the container's documents directory, gathers the tracked items
//! through the container's metadata query and then polls the query, diffing
//! successive snapshots into deltas. Trashed items are part of the snapshot
//! and are told apart from live ones by their removed flag.

use std::sync::Arc;
use std::time::Duration;

use marksync_core::domain::{CloudContents, CloudMetadataItem, IncomingEvent, SynchronizationError};
use marksync_core::ports::ICloudContainer;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{MonitorEvent, MonitorState};

/// Runs the container query and parses every entry
///
/// # Errors
/// - [`SynchronizationError::FailedToRetrieveMetadataQueryContent`] if the
///   query fails
/// - [`SynchronizationError::FailedToCreateMetadataItem`] if an entry lacks
///   required attributes; the whole query fails, no partial snapshot is returned
pub async fn query_contents(
    container: &dyn ICloudContainer,
    file_extension: &str,
) -> Result<CloudContents, SynchronizationError> {
    let result = container.query(file_extension).await.map_err(|e| {
        error!(error = %e, "Cloud metadata query failed");
        SynchronizationError::FailedToRetrieveMetadataQueryContent
    })?;

    let mut items = Vec::with_capacity(result.items.len());
    for attributes in result.items {
        let url = attributes.url.clone();
        match CloudMetadataItem::try_from(attributes) {
            Ok(item) => items.push(item),
            Err(e) => {
                error!(url = ?url, error = %e, "Cannot create cloud metadata item");
                return Err(SynchronizationError::FailedToCreateMetadataItem);
            }
        }
    }
    Ok(CloudContents::new(items))
}

// ============================================================================
// CloudDirectoryMonitor
// ============================================================================

/// Watches the cloud container
pub struct CloudDirectoryMonitor {
    container: Arc<dyn ICloudContainer>,
    file_extension: String,
    poll_interval: Duration,
    state: watch::Sender<MonitorState>,
    cancel: Option<CancellationToken>,
}

impl CloudDirectoryMonitor {
    /// Creates a stopped monitor
    ///
    /// # Arguments
    /// * `container` - The cloud container to watch
    /// * `file_extension` - Tracked extension without the leading dot
    /// * `poll_interval` - Delay between two container queries
    pub fn new(
        container: Arc<dyn ICloudContainer>,
        file_extension: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Stopped);
        Self {
            container,
            file_extension: file_extension.into(),
            poll_interval,
            state,
            cancel: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Returns true if the cloud account and container are usable
    pub fn is_cloud_available(&self) -> bool {
        self.container.is_available()
    }

    /// Gathers the container contents and starts polling
    ///
    /// # Errors
    /// - [`SynchronizationError::ICloudIsNotAvailable`] if the container is
    ///   unavailable
    /// - [`SynchronizationError::ContainerNotFound`] if the documents
    ///   directory cannot be resolved
    /// - any error of [`query_contents`]
    pub async fn start(
        &mut self,
        sender: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Result<(), SynchronizationError> {
        if self.state() != MonitorState::Stopped {
            debug!("Cloud directory monitor already running");
            return Ok(());
        }
        if !self.container.is_available() {
            warn!("Cloud container is not available");
            return Err(SynchronizationError::ICloudIsNotAvailable);
        }

        let documents = self.container.resolve_documents_dir().await.map_err(|e| {
            error!(error = %e, "Cannot resolve cloud documents directory");
            SynchronizationError::ContainerNotFound
        })?;
        info!(documents = %documents.display(), "Starting cloud directory monitor");

        let contents = query_contents(self.container.as_ref(), &self.file_extension).await?;
        info!(
            live = contents.live_items().count(),
            trashed = contents.trashed_items().count(),
            "Gathered cloud contents"
        );
        let gathered = IncomingEvent::DidFinishGatheringCloudContents(contents.clone());
        if sender.send(MonitorEvent::Contents(gathered)).is_err() {
            warn!("Event receiver dropped before cloud contents were delivered");
        }

        self.state.send_replace(MonitorState::Started);
        let cancel = CancellationToken::new();
        let task = CloudMonitorTask {
            container: Arc::clone(&self.container),
            file_extension: self.file_extension.clone(),
            contents,
            sender,
        };
        tokio::spawn(task.run(self.state.subscribe(), cancel.clone(), self.poll_interval));
        self.cancel = Some(cancel);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            info!("Stopping cloud directory monitor");
            cancel.cancel();
        }
        self.state.send_replace(MonitorState::Stopped);
    }

    /// Suspends polling; the resolved container and snapshot are kept
    pub fn pause(&mut self) {
        if self.state() == MonitorState::Started {
            debug!("Pausing cloud directory monitor");
            self.state.send_replace(MonitorState::Paused);
        }
    }

    pub fn resume(&mut self) {
        if self.state() == MonitorState::Paused {
            debug!("Resuming cloud directory monitor");
            self.state.send_replace(MonitorState::Started);
        }
    }
}

impl std::fmt::Debug for CloudDirectoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudDirectoryMonitor")
            .field("file_extension", &self.file_extension)
            .field("poll_interval", &self.poll_interval)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for CloudDirectoryMonitor {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Background task
// ============================================================================

struct CloudMonitorTask {
    container: Arc<dyn ICloudContainer>,
    file_extension: String,
    contents: CloudContents,
    sender: mpsc::UnboundedSender<MonitorEvent>,
}

impl CloudMonitorTask {
    async fn run(
        mut self,
        mut state_rx: watch::Receiver<MonitorState>,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) {
        let mut poll_timer = tokio::time::interval(poll_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll_timer.tick().await;
        let mut paused = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = poll_timer.tick() => {
                    if !paused && !self.poll().await {
                        break;
                    }
                }

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    match state {
                        MonitorState::Paused => paused = true,
                        MonitorState::Started => paused = false,
                        MonitorState::Stopped => break,
                    }
                }
            }
        }
        debug!("Cloud monitor task finished");
    }

    /// Queries once and reports the delta; returns false if the task must stop
    async fn poll(&mut self) -> bool {
        if !self.container.is_available() {
            warn!("Cloud container became unavailable");
            let _ = self
                .sender
                .send(MonitorEvent::Failed(SynchronizationError::ICloudIsNotAvailable));
            return false;
        }

        let current = match query_contents(self.container.as_ref(), &self.file_extension).await {
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
            "Cloud contents changed"
        );
        self.contents = current;
        self.sender
            .send(MonitorEvent::Contents(IncomingEvent::DidUpdateCloudContents(update)))
            .is_ok()
    }
}
