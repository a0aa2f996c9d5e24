//! Atomic write primitives.
//!
//! Content goes to `<dest>.tmp<digits>` in the destination directory, is
//! flushed to disk, and is then renamed over the destination. Readers of
//! the destination see the old content or the new content, never a mix.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// Marker between a file name and the random suffix of its temp file.
pub const TEMP_MARKER: &str = ".tmp";

/// Temp file name next to `dest`: `<dest>.tmp<random digits>`.
pub fn temp_path(dest: &Path) -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    let mut name = OsString::from(dest.as_os_str());
    name.push(format!("{}{}", TEMP_MARKER, suffix));
    PathBuf::from(name)
}

/// How a finished temp file replaces its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameStrategy {
    /// `rename(2)` replaces the destination, even while it is open.
    Direct,

    /// The destination cannot be replaced while open: move it aside first,
    /// rename the temp file in, then delete the moved-aside copy.
    SwapAside,
}

impl RenameStrategy {
    /// Strategy for the platform we are running on.
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self::SwapAside
        } else {
            Self::Direct
        }
    }
}

/// Writes files through temp-file + rename.
#[derive(Debug, Clone, Copy)]
pub struct AtomicWriter {
    strategy: RenameStrategy,
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicWriter {
    /// Writer using the platform's rename strategy, decided once here.
    pub fn new() -> Self {
        Self::with_strategy(RenameStrategy::detect())
    }

    /// Writer with an explicit rename strategy.
    pub fn with_strategy(strategy: RenameStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> RenameStrategy {
        self.strategy
    }

    /// Atomically replace `dest` with `content`.
    ///
    /// A missing destination directory is created and the write retried
    /// once. The write runs on the blocking pool, so dropping this future
    /// does not stop it halfway: it either lands or cleans up its temp file.
    pub async fn write(&self, dest: &Path, content: &[u8]) -> StorageResult<()> {
        let writer = *self;
        let target = dest.to_path_buf();
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || writer.write_blocking(&target, &content))
            .await
            .map_err(|e| StorageError::io("write file", dest, io::Error::other(e)))?
    }

    /// Move a finished temp file onto `dest`. On failure `src` is removed.
    pub async fn rename_into_place(&self, src: &Path, dest: &Path) -> StorageResult<()> {
        let result = match self.strategy {
            RenameStrategy::Direct => fs::rename(src, dest).await,
            RenameStrategy::SwapAside => swap_aside(src, dest).await,
        };

        if let Err(e) = result {
            remove_quietly(src).await;
            return Err(StorageError::io("rename temp file", dest, e));
        }
        Ok(())
    }

    /// Blocking variant of [`AtomicWriter::write`], for callers outside the runtime.
    pub fn write_blocking(&self, dest: &Path, content: &[u8]) -> StorageResult<()> {
        match self.write_once_blocking(dest, content) {
            Err(StorageError::NotFound { .. }) => {
                let parent = parent_dir(dest);
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::io("create directory", parent, e))?;
                self.write_once_blocking(dest, content)
            }
            result => result,
        }
    }

    fn write_once_blocking(&self, dest: &Path, content: &[u8]) -> StorageResult<()> {
        let mut guard = TempFileGuard::new(temp_path(dest));
        let temp = guard.path();
        let mut file = std::fs::File::create(temp)
            .map_err(|e| StorageError::io("create temp file", temp, e))?;

        file.write_all(content)
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::io("write temp file", temp, e))?;
        drop(file);

        match self.strategy {
            RenameStrategy::Direct => std::fs::rename(temp, dest),
            RenameStrategy::SwapAside => swap_aside_blocking(temp, dest),
        }
        .map_err(|e| StorageError::io("rename temp file", dest, e))?;

        guard.disarm();
        debug!(path = %dest.display(), bytes = content.len(), "wrote file");
        Ok(())
    }
}

/// Unlinks a temp file on drop unless [`disarm`](Self::disarm)ed.
///
/// Covers early returns and futures dropped mid-write alike.
#[derive(Debug)]
pub(crate) struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// The temp file was renamed into place or removed by the owner.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "discarded temp file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove temp file"),
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

async fn swap_aside(src: &Path, dest: &Path) -> io::Result<()> {
    let aside = temp_path(dest);
    let moved_aside = fs::rename(dest, &aside).await.is_ok();

    if let Err(e) = fs::rename(src, dest).await {
        if moved_aside {
            let _ = fs::rename(&aside, dest).await;
        }
        return Err(e);
    }

    if moved_aside {
        remove_quietly(&aside).await;
    }
    Ok(())
}

fn swap_aside_blocking(src: &Path, dest: &Path) -> io::Result<()> {
    let aside = temp_path(dest);
    let moved_aside = std::fs::rename(dest, &aside).is_ok();

    if let Err(e) = std::fs::rename(src, dest) {
        if moved_aside {
            let _ = std::fs::rename(&aside, dest);
        }
        return Err(e);
    }

    if moved_aside {
        let _ = std::fs::remove_file(&aside);
    }
    Ok(())
}

/// Best-effort unlink; a file that is already gone is fine.
async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
    }
}
