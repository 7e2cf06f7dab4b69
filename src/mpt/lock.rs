//! Exclusive directory locking.
//!
//! A state directory is guarded by a `~lock` file created exclusively at
//! open. The lock survives a killed process on purpose: a leftover lock
//! file marks a directory that was not shut down cleanly.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{MptError, Result};

const LOCK_FILE_NAME: &str = "~lock";

/// An exclusive lock on a state directory.
///
/// The lock must be released explicitly; dropping it leaves the lock file
/// in place.
pub struct DirectoryLock {
    path: PathBuf,
}

impl DirectoryLock {
    /// Acquires the lock, creating the directory if needed.
    ///
    /// Fails with [`MptError::LockContention`] when another instance holds
    /// the directory.
    pub fn acquire(directory: impl AsRef<Path>) -> Result<DirectoryLock> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory).map_err(|e| MptError::io(directory, e))?;
        let path = directory.join(LOCK_FILE_NAME);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!(path = %path.display(), "directory lock acquired");
                Ok(DirectoryLock { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(MptError::LockContention { path })
            }
            Err(e) => Err(MptError::io(path, e)),
        }
    }

    /// Releases the lock by removing the lock file.
    pub fn release(self) -> Result<()> {
        fs::remove_file(&self.path).map_err(|e| MptError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DirectoryLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
        lock.release().unwrap();
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DirectoryLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            DirectoryLock::acquire(dir.path()),
            Err(MptError::LockContention { .. })
        ));
        lock.release().unwrap();

        // After a release the directory can be locked again.
        DirectoryLock::acquire(dir.path()).unwrap().release().unwrap();
    }

    #[test]
    fn test_lock_survives_drop() {
        let dir = tempfile::tempdir().unwrap();
        drop(DirectoryLock::acquire(dir.path()).unwrap());
        // The dropped lock still blocks a new acquisition.
        assert!(matches!(
            DirectoryLock::acquire(dir.path()),
            Err(MptError::LockContention { .. })
        ));
    }
}
