//! Bookmark model port
//!
//! The writer never parses bookmark files. When it changes a file in the
//! local directory it asks the model to reload or drop the category that
//! file backs.

use std::path::Path;

/// Receiver of local file changes made by synchronization
pub trait IBookmarkModel: Send + Sync {
    /// Re-reads the category stored at `path`
    fn reload_category(&self, path: &Path);

    /// Forgets the category that was stored at `path`
    fn delete_category(&self, path: &Path);
}
