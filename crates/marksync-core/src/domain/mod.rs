//! Domain entities
//!
//! This module contains the core value types of the synchronization engine:
//! - Metadata items describing one tracked file in either store
//! - Snapshots (`Contents`) and deltas (`ContentsUpdate`) of a store
//! - Incoming events (monitor → resolver) and outgoing events (resolver → writer)
//! - Domain-specific error types

pub mod contents;
pub mod errors;
pub mod events;
pub mod metadata_item;

// Re-export commonly used types
pub use contents::{CloudContents, Contents, ContentsUpdate, LocalContents};
pub use errors::{ErrorSeverity, MetadataItemError, ProviderError, SynchronizationError};
pub use events::{IncomingEvent, OutgoingEvent};
pub use metadata_item::{
    truncate_to_seconds, CloudItemAttributes, CloudMetadataItem, LocalMetadataItem, MetadataItem,
};
