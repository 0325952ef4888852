//! Domain error types
//!
//! [`SynchronizationError`] is the error vocabulary shared by the monitors,
//! the writer and the manager. Each variant has an [`ErrorSeverity`] which
//! decides how the manager reacts to it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider code for a file the cloud cannot serve
pub const PROVIDER_FILE_UNAVAILABLE: i64 = 4354;
/// Provider code for an upload rejected because the account is over quota
pub const PROVIDER_QUOTA_EXCEEDED: i64 = 4355;
/// Provider code for an unreachable ubiquity server
pub const PROVIDER_SERVER_NOT_AVAILABLE: i64 = 4356;

/// How the manager reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSeverity {
    /// Recorded in the observable state; synchronization keeps running
    Transient,
    /// Synchronization stops but stays enabled until the account is back
    AccountLevel,
    /// Synchronization stops and is disabled
    Fatal,
}

/// Opaque error reported by the cloud provider for a single item
#[derive(Debug, Error, Clone, PartialEq, Eq, Hash)]
#[error("Provider error {code}: {description}")]
pub struct ProviderError {
    /// Provider-specific numeric code
    pub code: i64,
    /// Human readable description
    pub description: String,
}

impl ProviderError {
    pub fn new(code: i64, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Errors raised while turning raw store records into metadata items
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataItemError {
    /// A required provider attribute was absent
    #[error("Missing attribute: {0}")]
    MissingAttribute(&'static str),

    /// The path has no UTF-8 file name
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    /// The path is not a regular file
    #[error("Not a regular file: {0}")]
    NotAFile(String),

    /// File metadata could not be read
    #[error("Cannot read metadata of {path}: {reason}")]
    Unreadable {
        /// The offending path
        path: String,
        /// Underlying OS error
        reason: String,
    },
}

/// Errors surfaced by synchronization
#[derive(Debug, Error, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynchronizationError {
    #[error("The file is unavailable in the cloud")]
    FileUnavailable,

    #[error("The file was not uploaded because the cloud storage quota is exceeded")]
    FileNotUploadedDueToQuota,

    #[error("The ubiquity server is not available")]
    UbiquityServerNotAvailable,

    #[error("Cloud provider error {code}: {description}")]
    Provider { code: i64, description: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("iCloud is not available")]
    ICloudIsNotAvailable,

    #[error("The cloud container was not found")]
    ContainerNotFound,

    #[error("Failed to open the local directory file descriptor")]
    FailedToOpenLocalDirectoryFileDescriptor,

    #[error("Failed to retrieve the local directory content")]
    FailedToRetrieveLocalDirectoryContent,

    #[error("Failed to create a metadata item")]
    FailedToCreateMetadataItem,

    #[error("Failed to retrieve the metadata query content")]
    FailedToRetrieveMetadataQueryContent,
}

impl SynchronizationError {
    /// Maps a per-item provider error onto the synchronization vocabulary
    pub fn from_provider_error(error: ProviderError) -> Self {
        match error.code {
            PROVIDER_FILE_UNAVAILABLE => Self::FileUnavailable,
            PROVIDER_QUOTA_EXCEEDED => Self::FileNotUploadedDueToQuota,
            PROVIDER_SERVER_NOT_AVAILABLE => Self::UbiquityServerNotAvailable,
            code => Self::Provider {
                code,
                description: error.description,
            },
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::FileUnavailable
            | Self::FileNotUploadedDueToQuota
            | Self::UbiquityServerNotAvailable
            | Self::Provider { .. }
            | Self::Io(_) => ErrorSeverity::Transient,
            Self::ICloudIsNotAvailable | Self::ContainerNotFound => ErrorSeverity::AccountLevel,
            Self::FailedToOpenLocalDirectoryFileDescriptor
            | Self::FailedToRetrieveLocalDirectoryContent
            | Self::FailedToCreateMetadataItem
            | Self::FailedToRetrieveMetadataQueryContent => ErrorSeverity::Fatal,
        }
    }

    /// Returns true for errors worth a bug report
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }
}

impl From<MetadataItemError> for SynchronizationError {
    fn from(_: MetadataItemError) -> Self {
        Self::FailedToCreateMetadataItem
    }
}

impl From<std::io::Error> for SynchronizationError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}
