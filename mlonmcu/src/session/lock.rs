//! Exclusive environment lock.

use crate::errors::{FlowError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the lock file inside the locked directory.
pub const LOCK_FILE: &str = ".mlonmcu.lock";

/// Holds an exclusive lock on a directory until dropped.
///
/// The lock is a file created with `create_new`, so at most one holder can
/// exist at a time, also across processes. It is unrelated to the per-run
/// `active` flag.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Acquires the lock on `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::LockUnavailable`] if the lock is already held.
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                debug!(path = %path.display(), "Acquired lock");
                Ok(Self { path })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(FlowError::LockUnavailable { path })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "Failed to release lock");
        } else {
            debug!(path = %self.path.display(), "Released lock");
        }
    }
}
