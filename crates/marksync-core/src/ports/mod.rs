//! Port definitions
//!
//! Traits for the collaborators the synchronization engine drives but does
//! not own. Implementations live in adapter crates (`marksync-ubiquity`,
//! `marksync-daemon`) or in tests.
//!
//! ## Ports Overview
//!
//! - [`ICloudContainer`] - The cloud-replicated directory and its metadata queries
//! - [`ISettingsStore`] - Persisted user settings with change notification
//! - [`IBookmarkModel`] - The in-memory bookmark model that owns parsed categories

pub mod bookmark_model;
pub mod cloud_container;
pub mod settings;

pub use bookmark_model::IBookmarkModel;
pub use cloud_container::{CloudQueryResult, FileVersion, ICloudContainer};
pub use settings::{ISettingsStore, InMemorySettingsStore};
