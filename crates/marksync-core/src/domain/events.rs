//! Events flowing into and out of the resolver

use super::contents::{CloudContents, ContentsUpdate, LocalContents};
use super::errors::SynchronizationError;
use super::metadata_item::{CloudMetadataItem, LocalMetadataItem};

/// Notifications produced by the directory monitors
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingEvent {
    /// Full enumeration of the local directory
    DidFinishGatheringLocalContents(LocalContents),
    /// Full enumeration of the cloud container
    DidFinishGatheringCloudContents(CloudContents),
    /// Local changes since the last notification
    DidUpdateLocalContents(ContentsUpdate<LocalMetadataItem>),
    /// Cloud changes since the last notification
    DidUpdateCloudContents(ContentsUpdate<CloudMetadataItem>),
}

impl IncomingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DidFinishGatheringLocalContents(_) => "did_finish_gathering_local_contents",
            Self::DidFinishGatheringCloudContents(_) => "did_finish_gathering_cloud_contents",
            Self::DidUpdateLocalContents(_) => "did_update_local_contents",
            Self::DidUpdateCloudContents(_) => "did_update_cloud_contents",
        }
    }
}

/// Actions computed by the resolver and executed by the writer
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingEvent {
    /// Copy a cloud item that has no local counterpart
    CreateLocalItem(CloudMetadataItem),
    /// Replace the local file with the newer cloud item
    UpdateLocalItem(CloudMetadataItem),
    /// Delete the local file of an item removed in the cloud
    RemoveLocalItem(CloudMetadataItem),
    /// Ask the container to materialize a cloud item
    StartDownloading(CloudMetadataItem),
    /// Copy a local file that has no cloud counterpart
    CreateCloudItem(LocalMetadataItem),
    /// Replace the cloud file with the newer local item
    UpdateCloudItem(LocalMetadataItem),
    /// Move the cloud file of a locally deleted item to the trash
    RemoveCloudItem(LocalMetadataItem),
    /// Keep the latest diverging cloud version as a separate copy
    ResolveVersionsConflict(CloudMetadataItem),
    /// Preserve the local file under a device-specific name
    ResolveInitialSynchronizationConflict(LocalMetadataItem),
    /// The first reconciliation after enabling has been computed
    DidFinishInitialSynchronization,
    /// An error to surface to observers
    DidReceiveError(SynchronizationError),
}

impl OutgoingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateLocalItem(_) => "create_local_item",
            Self::UpdateLocalItem(_) => "update_local_item",
            Self::RemoveLocalItem(_) => "remove_local_item",
            Self::StartDownloading(_) => "start_downloading",
            Self::CreateCloudItem(_) => "create_cloud_item",
            Self::UpdateCloudItem(_) => "update_cloud_item",
            Self::RemoveCloudItem(_) => "remove_cloud_item",
            Self::ResolveVersionsConflict(_) => "resolve_versions_conflict",
            Self::ResolveInitialSynchronizationConflict(_) => {
                "resolve_initial_synchronization_conflict"
            }
            Self::DidFinishInitialSynchronization => "did_finish_initial_synchronization",
            Self::DidReceiveError(_) => "did_receive_error",
        }
    }

    /// Name of the file the event acts on, if any
    pub fn file_name(&self) -> Option<&str> {
        use super::metadata_item::MetadataItem;

        match self {
            Self::CreateLocalItem(item)
            | Self::UpdateLocalItem(item)
            | Self::RemoveLocalItem(item)
            | Self::StartDownloading(item)
            | Self::ResolveVersionsConflict(item) => Some(item.file_name()),
            Self::CreateCloudItem(item)
            | Self::UpdateCloudItem(item)
            | Self::RemoveCloudItem(item)
            | Self::ResolveInitialSynchronizationConflict(item) => Some(item.file_name()),
            Self::DidFinishInitialSynchronization | Self::DidReceiveError(_) => None,
        }
    }
}
