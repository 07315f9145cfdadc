//! Advisory `flock` locks serializing operations across processes.
//!
//! One lock file per tenant name guards every create/delete/lifecycle call,
//! and a single `uid-pool` lock guards uid allocation for the whole duration
//! of a create. Acquisition never blocks: a held lock is reported as
//! [`LockError::Busy`]. Locks are released when the guard drops.

use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    path::PathBuf,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another operation on `{0}` is in progress")]
    Busy(String),
    #[error("cannot open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct LockManager {
    dir: PathBuf,
}

/// Holds an exclusive advisory lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!("releasing lock `{}` failed: {}", self.key, err);
        }
    }
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Lock a tenant name.
    pub fn tenant(&self, name: &str) -> Result<LockGuard, LockError> {
        self.acquire(&format!("tenant-{}", name))
    }

    /// Lock the uid pool.
    pub fn uid_pool(&self) -> Result<LockGuard, LockError> {
        self.acquire("uid-pool")
    }

    fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let path = self.dir.join(format!("{}.lock", key));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired lock `{}`", key);
                Ok(LockGuard {
                    key: key.to_string(),
                    file,
                })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                Err(LockError::Busy(key.to_string()))
            }
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(LockError::Busy(key.to_string()))
            }
            Err(err) => Err(io_err(err)),
        }
    }
}
