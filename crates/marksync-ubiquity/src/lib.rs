//! marksync Ubiquity - Directory-backed cloud container
//!
//! Implements [`ICloudContainer`](marksync_core::ports::ICloudContainer) on
//! top of a plain directory laid out like a ubiquity container. A platform
//! sync client (or a test) keeps the directory in line with other devices;
//! this crate only reads and rearranges it.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── Documents/            materialized files
//! │   └── .Trip.kml.icloud  placeholder of a file not downloaded yet
//! ├── .Remote/Trip.kml      content behind a placeholder
//! ├── .Trash/               removed files
//! └── .Versions/Trip.kml/   unresolved conflicting versions of Trip.kml
//! ```
//!
//! ## Modules
//!
//! - [`container`] - The [`DirectoryContainer`](container::DirectoryContainer) adapter
//! - [`placeholder`] - Placeholder records for not-downloaded files

pub mod container;
pub mod placeholder;

use std::path::PathBuf;

use thiserror::Error;

pub use container::DirectoryContainer;

/// Errors raised by the directory container
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container root does not exist
    #[error("Container not found: {0}")]
    NotFound(PathBuf),

    /// A path does not name a file inside the container
    #[error("Invalid container path: {0}")]
    InvalidPath(PathBuf),

    /// A placeholder record could not be read
    #[error("Invalid placeholder {path}: {reason}")]
    InvalidPlaceholder {
        /// Placeholder file
        path: PathBuf,
        /// Parse failure
        reason: String,
    },

    /// Content behind a placeholder is missing
    #[error("Remote content missing for {0}")]
    RemoteContentMissing(String),

    /// An I/O error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
