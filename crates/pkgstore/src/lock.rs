//! Advisory locking for manifest read-modify-write.
//!
//! [`LockService`] is the seam the manifest store locks through. The
//! bundled [`FileLockService`] keeps a `<file>.lock` next to the locked
//! file and holds an OS advisory lock on it for as long as the lock is
//! held. A lock that cannot be taken right away is reported as busy; there
//! is no waiting queue.
//!
//! Because the OS drops advisory locks when a process dies, a `.lock` file
//! left behind by a crashed holder does not block anyone.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fs2::FileExt;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

/// Why a lock-and-read did not produce a document.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Someone else holds the lock.
    #[error("lock is held elsewhere")]
    Busy,

    /// The file to lock does not exist.
    #[error("file not found")]
    NotFound,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Cross-process lock over a JSON file.
#[async_trait]
pub trait LockService: Send + Sync + std::fmt::Debug {
    /// Lock `path` exclusively, then read and parse it.
    ///
    /// On error nothing stays locked.
    async fn lock_and_read(&self, path: &Path) -> Result<Value, LockError>;

    /// Release a lock taken by [`LockService::lock_and_read`].
    async fn unlock(&self, path: &Path) -> io::Result<()>;
}

/// Lock file path for `path`: `<path>.lock`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// [`LockService`] backed by `.lock` files and OS advisory locks.
#[derive(Debug, Default)]
pub struct FileLockService {
    held: Mutex<HashMap<PathBuf, File>>,
}

impl FileLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this service currently holds the lock on `path`.
    pub fn is_held(&self, path: &Path) -> bool {
        self.held().contains_key(path)
    }

    fn held(&self) -> MutexGuard<'_, HashMap<PathBuf, File>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn release(&self, path: &Path, file: File) -> io::Result<()> {
        // Unlink while still holding the OS lock so nobody can lock the old inode in between.
        let removed = match fs::remove_file(lock_path(path)).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        let unlocked = FileExt::unlock(&file);
        drop(file);
        removed.and(unlocked)
    }
}

#[async_trait]
impl LockService for FileLockService {
    async fn lock_and_read(&self, path: &Path) -> Result<Value, LockError> {
        let lock_file = lock_path(path);
        let file = tokio::task::spawn_blocking(move || acquire(&lock_file))
            .await
            .map_err(|e| LockError::Io(io::Error::other(e)))??;

        let parsed = match fs::read(path).await {
            Ok(content) => serde_json::from_slice(&content).map_err(LockError::Parse),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LockError::NotFound),
            Err(e) => Err(LockError::Io(e)),
        };

        match parsed {
            Ok(document) => {
                self.held().insert(path.to_path_buf(), file);
                debug!(path = %path.display(), "acquired lock");
                Ok(document)
            }
            Err(err) => {
                if let Err(e) = self.release(path, file).await {
                    warn!(path = %path.display(), error = %e, "failed to release lock after read error");
                }
                Err(err)
            }
        }
    }

    async fn unlock(&self, path: &Path) -> io::Result<()> {
        let file = self.held().remove(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not locked", path.display()),
            )
        })?;
        self.release(path, file).await?;
        debug!(path = %path.display(), "released lock");
        Ok(())
    }
}

fn acquire(lock_file: &Path) -> Result<File, LockError> {
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_file)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LockError::NotFound),
        Err(e) => return Err(LockError::Io(e)),
    };

    if let Err(e) = FileExt::try_lock_exclusive(&file) {
        let contended = e.kind() == io::ErrorKind::WouldBlock
            || e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
        return Err(if contended {
            LockError::Busy
        } else {
            LockError::Io(e)
        });
    }

    // The previous holder may have unlinked the file between our open and our lock.
    if !still_linked(&file, lock_file)? {
        return Err(LockError::Busy);
    }
    Ok(file)
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// Open files cannot be unlinked here, so the race does not exist.
#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}
