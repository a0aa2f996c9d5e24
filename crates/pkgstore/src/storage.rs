//! Registry-wide storage engine.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::atomic::AtomicWriter;
use crate::config::ConfigProvider;
use crate::error::StorageResult;
use crate::index::PackageIndex;
use crate::lock::{FileLockService, LockService};
use crate::store::{resolve_package_dir, PackageStore};

/// Local storage: the package index plus per-package store handles.
///
/// One instance per process. Manifest locking goes through a single
/// [`LockService`] shared by every [`PackageStore`] handed out.
#[derive(Debug)]
pub struct LocalStorage {
    config: Arc<dyn ConfigProvider>,
    index: Mutex<PackageIndex>,
    locks: Arc<dyn LockService>,
    writer: AtomicWriter,
}

impl LocalStorage {
    /// Load the index and set up file-based manifest locking.
    pub fn open(config: Arc<dyn ConfigProvider>) -> StorageResult<Self> {
        Self::with_lock_service(config, Arc::new(FileLockService::new()))
    }

    /// Load the index, locking manifests through `locks`.
    pub fn with_lock_service(
        config: Arc<dyn ConfigProvider>,
        locks: Arc<dyn LockService>,
    ) -> StorageResult<Self> {
        let index = PackageIndex::load(config.as_ref())?;
        Ok(Self {
            config,
            index: Mutex::new(index),
            locks,
            writer: AtomicWriter::new(),
        })
    }

    fn index(&self) -> MutexGuard<'_, PackageIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a locally published package.
    pub fn add_package(&self, name: &str) -> StorageResult<()> {
        self.index().add(name)
    }

    /// Forget a locally published package.
    pub fn remove_package(&self, name: &str) -> StorageResult<()> {
        self.index().remove(name)
    }

    /// Locally published packages, in publish order.
    pub fn packages(&self) -> Vec<String> {
        self.index().list()
    }

    pub fn secret(&self) -> String {
        self.index().secret().to_string()
    }

    /// Whether index writes are refused because the index file was damaged.
    pub fn is_index_locked(&self) -> bool {
        self.index().is_locked()
    }

    pub fn index_path(&self) -> PathBuf {
        self.index().path().to_path_buf()
    }

    /// Store handle for package `name`, or `None` if it has no storage configured.
    pub fn package_store(&self, name: &str) -> Option<PackageStore> {
        let dir = resolve_package_dir(self.config.as_ref(), name)?;
        Some(PackageStore::with_lock_service(dir, Arc::clone(&self.locks)).with_writer(self.writer))
    }
}
