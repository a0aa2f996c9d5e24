//! Per-package storage handle.
//!
//! # Package Directory
//!
//! ```text
//! <storage-root>/<package-name>/
//!   package.json          # manifest, see `manifest.rs`
//!   package.json.lock     # present while an update holds the lock
//!   <name>-<version>.tgz  # tarballs, see `tarball/`
//!   *.tmp<digits>         # in-flight writes
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::debug;

use crate::atomic::AtomicWriter;
use crate::config::ConfigProvider;
use crate::error::{StorageError, StorageResult};
use crate::lock::{FileLockService, LockService};

/// File name of a package manifest.
pub const MANIFEST_FILE_NAME: &str = "package.json";

/// Resolve the directory of package `name`.
///
/// The matched package rule's storage wins over the default storage root;
/// both are relative to the config file's directory. Returns `None` when
/// neither is configured.
pub fn resolve_package_dir(config: &dyn ConfigProvider, name: &str) -> Option<PathBuf> {
    let root = config
        .matched_package_spec(name)
        .storage
        .or_else(|| config.storage_root().map(Path::to_path_buf));

    match root {
        Some(root) => Some(config.resolve_path(&root).join(name)),
        None => {
            debug!(name, "this package has no storage defined");
            None
        }
    }
}

/// Handle on one package directory: manifest operations and tarball streams.
#[derive(Debug, Clone)]
pub struct PackageStore {
    dir: PathBuf,
    pub(crate) writer: AtomicWriter,
    pub(crate) locks: Arc<dyn LockService>,
}

impl PackageStore {
    /// Store for `dir`, locking through a fresh [`FileLockService`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_lock_service(dir, Arc::new(FileLockService::new()))
    }

    /// Store for `dir`, locking through `locks`.
    pub fn with_lock_service(dir: impl Into<PathBuf>, locks: Arc<dyn LockService>) -> Self {
        Self {
            dir: dir.into(),
            writer: AtomicWriter::new(),
            locks,
        }
    }

    /// Use a specific atomic writer.
    pub fn with_writer(mut self, writer: AtomicWriter) -> Self {
        self.writer = writer;
        self
    }

    /// The package directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of a file inside the package directory.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.file_path(MANIFEST_FILE_NAME)
    }

    /// Delete a file from the package directory.
    pub async fn delete_file(&self, name: &str) -> StorageResult<()> {
        let path = self.file_path(name);
        fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::io("delete", &path, e))?;
        debug!(path = %path.display(), "deleted file");
        Ok(())
    }

    /// Remove the package directory. Fails unless it is empty.
    pub async fn remove_directory(&self) -> StorageResult<()> {
        fs::remove_dir(&self.dir)
            .await
            .map_err(|e| StorageError::io("remove directory", &self.dir, e))?;
        debug!(path = %self.dir.display(), "removed package directory");
        Ok(())
    }
}
