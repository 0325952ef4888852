//! Bookmark model adapter
//!
//! The daemon has no in-memory bookmark model of its own. It logs every
//! category the engine asks to reload or delete, and counts them for the
//! shutdown summary.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use marksync_core::ports::IBookmarkModel;
use tracing::info;

#[derive(Debug, Default)]
pub struct LoggingBookmarkModel {
    reloads: AtomicU64,
    deletes: AtomicU64,
}

impl LoggingBookmarkModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }
}

impl IBookmarkModel for LoggingBookmarkModel {
    fn reload_category(&self, path: &Path) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        info!(path = %path.display(), "Category changed on disk, reload requested");
    }

    fn delete_category(&self, path: &Path) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        info!(path = %path.display(), "Category removed on disk, delete requested");
    }
}
