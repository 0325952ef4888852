//! Synchronization state resolver
//!
//! The resolver keeps the last known snapshot of both stores and turns every
//! [`IncomingEvent`] into the ordered list of [`OutgoingEvent`]s that brings
//! the stores back in line. It never touches the filesystem and must be
//! driven from a single task.
//!
//! ## Ordering
//!
//! Events of one call are emitted in fixed tiers:
//!
//! ```text
//! errors → version conflicts → initial sync conflicts → downloads
//!        → removals → creates → updates → DidFinishInitialSynchronization
//! ```
//!
//! Version conflicts block every tier after them for that call.
//!
//! ## Comparison rules
//!
//! Items are matched by file name. A side wins only when its modification
//! date is strictly greater; equal dates mean there is nothing to do.

use std::collections::HashSet;

use marksync_core::domain::{
    CloudContents, CloudMetadataItem, ContentsUpdate, IncomingEvent, LocalContents,
    LocalMetadataItem, MetadataItem, OutgoingEvent, SynchronizationError,
};
use tracing::{debug, info};

// ============================================================================
// EventBuffer - tiered output
// ============================================================================

#[derive(Debug, Default)]
struct EventBuffer {
    errors: Vec<OutgoingEvent>,
    versions_conflicts: Vec<OutgoingEvent>,
    initial_conflicts: Vec<OutgoingEvent>,
    downloads: Vec<OutgoingEvent>,
    removals: Vec<OutgoingEvent>,
    creates: Vec<OutgoingEvent>,
    updates: Vec<OutgoingEvent>,
    finished_initial_synchronization: bool,
}

fn push_unique(tier: &mut Vec<OutgoingEvent>, event: OutgoingEvent) {
    if !tier.contains(&event) {
        tier.push(event);
    }
}

impl EventBuffer {
    fn error(&mut self, error: SynchronizationError) {
        push_unique(&mut self.errors, OutgoingEvent::DidReceiveError(error));
    }

    fn versions_conflict(&mut self, item: CloudMetadataItem) {
        push_unique(
            &mut self.versions_conflicts,
            OutgoingEvent::ResolveVersionsConflict(item),
        );
    }

    fn has_versions_conflicts(&self) -> bool {
        !self.versions_conflicts.is_empty()
    }

    fn initial_conflict(&mut self, item: LocalMetadataItem) {
        push_unique(
            &mut self.initial_conflicts,
            OutgoingEvent::ResolveInitialSynchronizationConflict(item),
        );
    }

    fn download(&mut self, item: CloudMetadataItem) {
        push_unique(&mut self.downloads, OutgoingEvent::StartDownloading(item));
    }

    fn removal(&mut self, event: OutgoingEvent) {
        push_unique(&mut self.removals, event);
    }

    fn create(&mut self, event: OutgoingEvent) {
        push_unique(&mut self.creates, event);
    }

    fn update(&mut self, event: OutgoingEvent) {
        push_unique(&mut self.updates, event);
    }

    /// Creates a cloud item locally, or asks for it first if not materialized
    fn create_local(&mut self, item: CloudMetadataItem) {
        if item.is_downloaded() {
            self.create(OutgoingEvent::CreateLocalItem(item));
        } else {
            self.download(item);
        }
    }

    /// Overwrites the local file with a cloud item, or asks for it first
    fn update_local(&mut self, item: CloudMetadataItem) {
        if item.is_downloaded() {
            self.update(OutgoingEvent::UpdateLocalItem(item));
        } else {
            self.download(item);
        }
    }

    fn into_events(self) -> Vec<OutgoingEvent> {
        let mut events = self.errors;
        if !self.versions_conflicts.is_empty() {
            events.extend(self.versions_conflicts);
            return events;
        }
        events.extend(self.initial_conflicts);
        events.extend(self.downloads);
        events.extend(self.removals);
        events.extend(self.creates);
        events.extend(self.updates);
        if self.finished_initial_synchronization {
            events.push(OutgoingEvent::DidFinishInitialSynchronization);
        }
        events
    }
}

// ============================================================================
// SynchronizationStateResolver
// ============================================================================

/// Computes outgoing actions from local and cloud snapshots
#[derive(Debug)]
pub struct SynchronizationStateResolver {
    current_local_contents: LocalContents,
    current_cloud_contents: CloudContents,
    local_gathering_finished: bool,
    cloud_gathering_finished: bool,
    is_initial_synchronization: bool,
    /// Names whose cloud version must replace the local file once downloaded
    pending_cloud_pulls: HashSet<String>,
}

impl SynchronizationStateResolver {
    /// Creates a resolver with empty snapshots
    ///
    /// # Arguments
    /// * `is_initial_synchronization` - true when no initial synchronization
    ///   has completed since synchronization was last enabled
    pub fn new(is_initial_synchronization: bool) -> Self {
        Self {
            current_local_contents: LocalContents::default(),
            current_cloud_contents: CloudContents::default(),
            local_gathering_finished: false,
            cloud_gathering_finished: false,
            is_initial_synchronization,
            pending_cloud_pulls: HashSet::new(),
        }
    }

    /// Drops both snapshots and starts over
    pub fn reset(&mut self, is_initial_synchronization: bool) {
        *self = Self::new(is_initial_synchronization);
    }

    pub fn is_initial_synchronization(&self) -> bool {
        self.is_initial_synchronization
    }

    pub fn current_local_contents(&self) -> &LocalContents {
        &self.current_local_contents
    }

    pub fn current_cloud_contents(&self) -> &CloudContents {
        &self.current_cloud_contents
    }

    /// Resolves one incoming event into the ordered outgoing events
    pub fn resolve_event(&mut self, event: IncomingEvent) -> Vec<OutgoingEvent> {
        let kind = event.kind();
        let events = match event {
            IncomingEvent::DidFinishGatheringLocalContents(contents) => {
                self.resolve_did_finish_gathering_local(contents)
            }
            IncomingEvent::DidFinishGatheringCloudContents(contents) => {
                self.resolve_did_finish_gathering_cloud(contents)
            }
            IncomingEvent::DidUpdateLocalContents(update) => self.resolve_did_update_local(update),
            IncomingEvent::DidUpdateCloudContents(update) => self.resolve_did_update_cloud(update),
        };
        debug!(incoming = kind, outgoing = events.len(), "Resolved incoming event");
        events
    }

    fn both_gathered(&self) -> bool {
        self.local_gathering_finished && self.cloud_gathering_finished
    }

    // ------------------------------------------------------------------------
    // Gathering
    // ------------------------------------------------------------------------

    fn resolve_did_finish_gathering_local(
        &mut self,
        contents: LocalContents,
    ) -> Vec<OutgoingEvent> {
        if self.local_gathering_finished && self.current_local_contents == contents {
            debug!("Local contents unchanged since last gathering");
            return Vec::new();
        }
        if self.both_gathered() && !self.is_initial_synchronization {
            // Restarted monitor: changes made while it was stopped are local edits
            let update = self.current_local_contents.diff(&contents);
            debug!(
                added = update.added.len(),
                updated = update.updated.len(),
                removed = update.removed.len(),
                "Local contents regathered"
            );
            return self.resolve_did_update_local(update);
        }
        self.current_local_contents = contents;
        self.local_gathering_finished = true;
        self.resolve_full_if_ready()
    }

    fn resolve_did_finish_gathering_cloud(
        &mut self,
        contents: CloudContents,
    ) -> Vec<OutgoingEvent> {
        if self.cloud_gathering_finished && self.current_cloud_contents == contents {
            debug!("Cloud contents unchanged since last gathering");
            return Vec::new();
        }
        if self.both_gathered() && !self.is_initial_synchronization {
            let update = self.current_cloud_contents.diff(&contents);
            return self.resolve_did_update_cloud(update);
        }
        self.current_cloud_contents = contents;
        self.cloud_gathering_finished = true;
        self.resolve_full_if_ready()
    }

    fn resolve_full_if_ready(&mut self) -> Vec<OutgoingEvent> {
        if !self.both_gathered() {
            return Vec::new();
        }

        let mut buffer = EventBuffer::default();
        for item in self.current_cloud_contents.live_items() {
            if let Some(error) = item.transfer_error() {
                buffer.error(error.clone());
            }
        }

        let local_empty = self.current_local_contents.is_empty();
        let cloud_empty = self.current_cloud_contents.is_empty();
        match (local_empty, cloud_empty) {
            (true, true) => {}
            (true, false) => {
                for item in self.current_cloud_contents.live_items() {
                    buffer.create_local(item.clone());
                }
            }
            (false, true) => {
                for item in self.current_local_contents.iter() {
                    buffer.create(OutgoingEvent::CreateCloudItem(item.clone()));
                }
            }
            (false, false) if self.is_initial_synchronization => {
                self.resolve_initial_synchronization(&mut buffer);
            }
            (false, false) => self.resolve_steady_state(&mut buffer),
        }
        buffer.into_events()
    }

    /// First reconciliation with data on both sides: keep every variant
    fn resolve_initial_synchronization(&mut self, buffer: &mut EventBuffer) {
        let mut conflicts = 0usize;
        for local in self.current_local_contents.iter() {
            match self.current_cloud_contents.live_item(local.file_name()) {
                Some(cloud)
                    if cloud.last_modification_date() != local.last_modification_date() =>
                {
                    conflicts += 1;
                    buffer.initial_conflict(local.clone());
                    if cloud.is_downloaded() {
                        buffer.update(OutgoingEvent::UpdateLocalItem(cloud.clone()));
                    } else {
                        buffer.download(cloud.clone());
                        self.pending_cloud_pulls
                            .insert(cloud.file_name().to_string());
                    }
                }
                Some(_) => {}
                None => buffer.create(OutgoingEvent::CreateCloudItem(local.clone())),
            }
        }

        for cloud in self.current_cloud_contents.live_items() {
            if self
                .current_local_contents
                .live_item(cloud.file_name())
                .is_none()
            {
                buffer.create_local(cloud.clone());
            }
        }

        buffer.finished_initial_synchronization = true;
        self.is_initial_synchronization = false;
        info!(conflicts, "Initial synchronization resolved");
    }

    /// Full reconciliation outside initial synchronization
    fn resolve_steady_state(&mut self, buffer: &mut EventBuffer) {
        for item in self.current_cloud_contents.items_with_unresolved_conflicts() {
            buffer.versions_conflict(item.clone());
        }
        if buffer.has_versions_conflicts() {
            return;
        }

        let mut names: Vec<String> = Vec::new();
        let all_names = self
            .current_local_contents
            .iter()
            .map(|item| item.file_name())
            .chain(self.current_cloud_contents.iter().map(|item| item.file_name()));
        for name in all_names {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }

        for name in &names {
            self.reconcile_with_cloud(name, buffer);
        }
    }

    // ------------------------------------------------------------------------
    // Incremental updates
    // ------------------------------------------------------------------------

    fn resolve_did_update_local(
        &mut self,
        update: ContentsUpdate<LocalMetadataItem>,
    ) -> Vec<OutgoingEvent> {
        self.current_local_contents.apply(&update);
        if !self.both_gathered() {
            return Vec::new();
        }

        let mut buffer = EventBuffer::default();
        let cloud = &self.current_cloud_contents;

        for item in &update.removed {
            let name = item.file_name();
            if self.pending_cloud_pulls.contains(name)
                || self.current_local_contents.live_item(name).is_some()
                || cloud.effective_removal(name).is_some()
            {
                continue;
            }
            if cloud.live_item(name).is_some() {
                buffer.removal(OutgoingEvent::RemoveCloudItem(item.clone()));
            }
        }

        let changed = update
            .added
            .iter()
            .map(|item| (item, true))
            .chain(update.updated.iter().map(|item| (item, false)));
        for (item, is_new) in changed {
            let name = item.file_name();
            if self.pending_cloud_pulls.contains(name) {
                continue;
            }
            let live = cloud.live_item(name);

            if let Some(trashed) = cloud.effective_removal(name) {
                if item.is_newer_than(trashed) {
                    push_local_to_cloud(&mut buffer, item, live.is_some());
                } else {
                    buffer.removal(OutgoingEvent::RemoveLocalItem(trashed.clone()));
                }
                continue;
            }

            match live {
                None => buffer.create(OutgoingEvent::CreateCloudItem(item.clone())),
                Some(cloud_item) if item.is_newer_than(cloud_item) => {
                    buffer.update(OutgoingEvent::UpdateCloudItem(item.clone()));
                }
                Some(cloud_item) if is_new && cloud_item.is_newer_than(item) => {
                    buffer.update_local(cloud_item.clone());
                }
                Some(_) => {}
            }
        }

        buffer.into_events()
    }

    fn resolve_did_update_cloud(
        &mut self,
        update: ContentsUpdate<CloudMetadataItem>,
    ) -> Vec<OutgoingEvent> {
        self.current_cloud_contents.apply(&update);
        if !self.both_gathered() {
            return Vec::new();
        }

        let mut buffer = EventBuffer::default();
        let changed: Vec<&CloudMetadataItem> =
            update.added.iter().chain(&update.updated).collect();

        for item in &changed {
            if let Some(error) = item.transfer_error() {
                buffer.error(error.clone());
            }
        }
        for item in &changed {
            if !item.is_removed() && item.has_unresolved_conflicts() {
                buffer.versions_conflict((*item).clone());
            }
        }
        if buffer.has_versions_conflicts() {
            return buffer.into_events();
        }

        for name in update.file_names() {
            self.reconcile_with_cloud(&name, &mut buffer);
        }
        buffer.into_events()
    }

    // ------------------------------------------------------------------------
    // Per-name rules
    // ------------------------------------------------------------------------

    /// Applies the cloud-driven rules to one file name
    ///
    /// A local file without any cloud entry is left alone.
    fn reconcile_with_cloud(&mut self, name: &str, buffer: &mut EventBuffer) {
        let local = self.current_local_contents.live_item(name).cloned();
        let live = self.current_cloud_contents.live_item(name).cloned();

        if let Some(trashed) = self.current_cloud_contents.effective_removal(name) {
            self.pending_cloud_pulls.remove(name);
            if let Some(local) = local {
                if local.is_newer_than(trashed) {
                    push_local_to_cloud(buffer, &local, live.is_some());
                } else {
                    buffer.removal(OutgoingEvent::RemoveLocalItem(trashed.clone()));
                }
            }
            return;
        }

        let Some(cloud) = live else {
            return;
        };

        if self.pending_cloud_pulls.contains(name) {
            if cloud.is_downloaded() {
                self.pending_cloud_pulls.remove(name);
                buffer.update(OutgoingEvent::UpdateLocalItem(cloud));
            } else {
                buffer.download(cloud);
            }
            return;
        }

        match local {
            None => buffer.create_local(cloud),
            Some(local) if cloud.is_newer_than(&local) => buffer.update_local(cloud),
            Some(local) if local.is_newer_than(&cloud) => {
                buffer.update(OutgoingEvent::UpdateCloudItem(local));
            }
            Some(_) => {}
        }
    }
}

/// Pushes a local file that outlived a cloud deletion
fn push_local_to_cloud(buffer: &mut EventBuffer, item: &LocalMetadataItem, live_exists: bool) {
    if live_exists {
        buffer.update(OutgoingEvent::UpdateCloudItem(item.clone()));
    } else {
        buffer.create(OutgoingEvent::CreateCloudItem(item.clone()));
    }
}
