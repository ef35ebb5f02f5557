//! Cross-process cache locking
//!
//! Multiple worker processes may share one cache directory. Every mutating
//! cache-wide pass holds an exclusive `flock` on a dedicated lock file for
//! its whole duration; the guard releases on every exit path.

use crate::error::{KilnError, KilnResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive, blocking file lock held for the guard's lifetime.
#[derive(Debug)]
pub struct ScopedLock {
    file: File,
    path: PathBuf,
}

impl ScopedLock {
    /// Acquire the lock, blocking until the holder releases it.
    ///
    /// Acquisition failure is fatal to the calling operation: proceeding
    /// without the lock risks ledger corruption.
    pub fn acquire(path: &Path) -> KilnResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| KilnError::CacheLock {
                path: path.to_path_buf(),
                source: e,
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(KilnError::CacheLock {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        debug!("Acquired cache lock at {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!("Released cache lock at {}", self.path.display());
    }
}
