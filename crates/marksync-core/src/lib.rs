//! marksync Core - Domain types and port definitions
//!
//! This crate contains the pieces of the bookmark synchronization engine that
//! do not touch the filesystem or a cloud provider directly:
//! - **Domain types** - `LocalMetadataItem`, `CloudMetadataItem`, `Contents`,
//!   `ContentsUpdate`, incoming/outgoing synchronization events
//! - **Error taxonomy** - `SynchronizationError` with its severity classes
//! - **Port definitions** - Traits for adapters: `ICloudContainer`,
//!   `ISettingsStore`, `IBookmarkModel`
//! - **Configuration** - YAML-backed `Config`
//!
//! # Architecture
//!
//! Same ports & adapters split as the rest of the workspace: the domain module
//! is pure data plus validation, ports are traits implemented by adapter
//! crates (`marksync-ubiquity`, `marksync-daemon`), and the reconciliation
//! logic in `marksync-sync` only ever sees typed domain values.

pub mod config;
pub mod domain;
pub mod ports;
