//! File coordination between the writer and other processes
//!
//! Uses `flock(2)` advisory locks so that the writer does not tear files
//! that the cloud provider's sync daemon or an editor holds open. Sources
//! are read under a shared lock and destinations are replaced or removed
//! under an exclusive lock. If a lock cannot be obtained within the
//! timeout the operation proceeds anyway with a warning.
//!
//! All functions here block and are meant to run inside
//! `tokio::task::spawn_blocking`.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::SyncError;

/// Default timeout for acquiring a lock before proceeding anyway
pub const FLOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between lock attempts
pub const FLOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Kind of advisory lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn operation(self) -> libc::c_int {
        match self {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }
}

/// RAII guard that releases the flock when dropped
#[derive(Debug)]
pub struct FlockGuard {
    file: File,
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        // SAFETY: flock with LOCK_UN is safe on a valid file descriptor
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Result of attempting to acquire a lock
#[derive(Debug)]
pub enum FlockResult {
    Acquired(FlockGuard),
    /// Timed out waiting; the caller proceeds without the lock
    Timeout,
}

/// Tries to lock `path`, retrying until `timeout`
///
/// # Errors
/// Returns the I/O error if the file cannot be opened (including
/// `NotFound`) or if `flock` fails for a reason other than contention.
pub fn try_flock(path: &Path, mode: LockMode, timeout: Duration) -> io::Result<FlockResult> {
    let start = Instant::now();

    loop {
        // Reopened on every attempt in case the file was replaced meanwhile
        let file = File::open(path)?;

        // SAFETY: flock is safe on a valid file descriptor
        let result = unsafe { libc::flock(file.as_raw_fd(), mode.operation() | libc::LOCK_NB) };
        if result == 0 {
            return Ok(FlockResult::Acquired(FlockGuard { file }));
        }

        let errno = io::Error::last_os_error();
        let raw_errno = errno.raw_os_error().unwrap_or(0);
        if raw_errno == libc::EINTR {
            continue;
        }
        if raw_errno != libc::EWOULDBLOCK && raw_errno != libc::EAGAIN {
            return Err(errno);
        }

        if start.elapsed() >= timeout {
            warn!(
                path = %path.display(),
                ?mode,
                elapsed = ?start.elapsed(),
                "flock timeout, proceeding anyway"
            );
            return Ok(FlockResult::Timeout);
        }
        std::thread::sleep(FLOCK_RETRY_INTERVAL);
    }
}

// ============================================================================
// FileCoordinator
// ============================================================================

/// Runs file operations under advisory locks
#[derive(Debug, Clone, Copy)]
pub struct FileCoordinator {
    timeout: Duration,
}

impl Default for FileCoordinator {
    fn default() -> Self {
        Self::new(FLOCK_TIMEOUT)
    }
}

impl FileCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Locks `path` if it exists; a missing file needs no lock
    fn lock_if_exists(&self, path: &Path, mode: LockMode) -> Result<Option<FlockResult>, SyncError> {
        match try_flock(path, mode, self.timeout) {
            Ok(result) => Ok(Some(result)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::IoError(e)),
        }
    }

    /// Runs `operation` while holding a shared lock on `source`
    ///
    /// # Errors
    /// Returns [`SyncError::PathNotFound`] if `source` does not exist, or
    /// whatever `operation` returns.
    pub fn coordinate_reading<R>(
        &self,
        source: &Path,
        operation: impl FnOnce() -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let _guard = self
            .lock_if_exists(source, LockMode::Shared)?
            .ok_or_else(|| SyncError::PathNotFound(source.to_path_buf()))?;
        debug!(source = %source.display(), "Coordinated read");
        operation()
    }

    /// Runs `operation` while holding an exclusive lock on `destination`
    pub fn coordinate_writing<R>(
        &self,
        destination: &Path,
        operation: impl FnOnce() -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let _guard = self.lock_if_exists(destination, LockMode::Exclusive)?;
        debug!(destination = %destination.display(), "Coordinated write");
        operation()
    }

    /// Runs `operation` with a shared lock on `source` and an exclusive
    /// lock on `destination`
    pub fn coordinate_reading_writing<R>(
        &self,
        source: &Path,
        destination: &Path,
        operation: impl FnOnce() -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        self.coordinate_reading(source, || self.coordinate_writing(destination, operation))
    }
}
