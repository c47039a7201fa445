//! Advisory lock preventing overlapping runs against one destination.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};
use fd_lock::{RwLock, RwLockWriteGuard};

pub const LOCK_FILE: &str = ".www-backup.lock";

#[derive(Debug, Display, Error)]
pub enum LockError {
    /// Another run currently uses the destination.
    #[display("Destination is locked by another run: {}", path.display())]
    Busy {
        #[error(ignore)]
        path: PathBuf,
    },
    #[display("Creating lock file {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Lock file of a destination directory.
pub struct DestinationLock {
    path: PathBuf,
    lock: RwLock<File>,
}

impl DestinationLock {
    /// Open (and create) the lock file of `destination`.
    pub fn open(destination: &Path) -> Result<Self, LockError> {
        let path = destination.join(LOCK_FILE);
        let io_error = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(destination).map_err(io_error)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_error)?;

        Ok(Self {
            path,
            lock: RwLock::new(file),
        })
    }

    /// Take the lock for the lifetime of the returned guard, failing fast if busy.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>, LockError> {
        match self.lock.try_write() {
            Ok(guard) => {
                log::debug!(target: "util::lock", "Acquired {}", self.path.display());
                Ok(guard)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockError::Busy {
                path: self.path.clone(),
            }),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
