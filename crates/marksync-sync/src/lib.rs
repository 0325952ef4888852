//! marksync Sync - Bookmark synchronization engine
//!
//! Provides:
//! - Local and cloud directory monitoring
//! - Reconciliation of the two stores into ordered file operations
//! - Coordinated, atomic execution of those operations
//! - Lifecycle management with observable state
//!
//! ## Modules
//!
//! - [`watcher`] - notify-based watcher and debounced change queue
//! - [`local_monitor`] - Local bookmark directory monitor
//! - [`cloud_monitor`] - Cloud container monitor
//! - [`resolver`] - Synchronization state resolver
//! - [`coordination`] - `flock(2)` based file coordination
//! - [`namer`] - Disambiguated names for conflict copies
//! - [`writer`] - Executes outgoing events against both stores
//! - [`manager`] - Wires everything together and owns the event loop
//!
//! ## Data flow
//!
//! ```text
//! LocalMonitor ──┐
//!                ├──→ mpsc::unbounded ──→ Resolver ──→ Writer ──→ IBookmarkModel
//! CloudMonitor ──┘
//! ```

pub mod cloud_monitor;
pub mod coordination;
pub mod local_monitor;
pub mod manager;
pub mod namer;
pub mod resolver;
pub mod watcher;
pub mod writer;

use std::path::PathBuf;

use marksync_core::domain::{IncomingEvent, SynchronizationError};
use thiserror::Error;

/// Message sent by a monitor to the manager's event loop
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// New contents to resolve
    Contents(IncomingEvent),
    /// The monitor failed and stopped reporting
    Failed(SynchronizationError),
}

/// Lifecycle state shared by the monitors and the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    #[default]
    Stopped,
    Started,
    Paused,
}

/// Errors that can occur while executing file operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A file stayed locked by another process
    #[error("File locked: {0}")]
    FileLocked(PathBuf),

    /// The source of a copy does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// The cloud container rejected a request
    #[error("Container error: {0}")]
    Container(String),

    /// An error already expressed in the synchronization vocabulary
    #[error("Synchronization error: {0}")]
    Synchronization(#[from] SynchronizationError),
}

impl From<SyncError> for SynchronizationError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::IoError(e) => SynchronizationError::Io(e.to_string()),
            SyncError::FileLocked(path) => {
                SynchronizationError::Io(format!("file locked: {}", path.display()))
            }
            SyncError::PathNotFound(_) => SynchronizationError::FileUnavailable,
            SyncError::Container(message) => SynchronizationError::Io(message),
            SyncError::Synchronization(e) => e,
        }
    }
}
