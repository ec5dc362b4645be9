//! Exclusive run lock.
//!
//! Only one pipeline run may touch a state directory at a time. The lock is an
//! OS-level advisory lock on `<state dir>/run.lock`, so a crashed run never
//! leaves a stale lock behind. The holder writes its pid and start time into
//! the file so a contending run can say who is in the way.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

use crate::LOCK_FILE;

/// Errors that can occur while acquiring the run lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another run is already in progress ({holder})")]
    AlreadyRunning { holder: String },

    #[error("Failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Guard for the exclusive run lock. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock without waiting.
    pub fn acquire(state_dir: &Path) -> Result<Self, LockError> {
        let path = state_dir.join(LOCK_FILE);
        let io_error = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(state_dir).map_err(io_error)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            return Err(LockError::AlreadyRunning {
                holder: if holder.is_empty() {
                    "unknown holder".to_string()
                } else {
                    holder.to_string()
                },
            });
        }

        file.set_len(0).map_err(io_error)?;
        file.seek(SeekFrom::Start(0)).map_err(io_error)?;
        write!(
            file,
            "pid {} since {}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )
        .map_err(io_error)?;
        file.flush().map_err(io_error)?;

        debug!("Acquired run lock {:?}", path);
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
        debug!("Released run lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_fast() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::acquire(dir.path()).unwrap();

        let err = RunLock::acquire(dir.path()).unwrap_err();
        match err {
            LockError::AlreadyRunning { holder } => {
                assert!(holder.contains(&std::process::id().to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(lock);
        assert!(RunLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_creates_state_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        let lock = RunLock::acquire(&nested).unwrap();
        assert!(lock.path().exists());
    }
}
