//! Registry-wide index of locally published package names.
//!
//! # File Structure
//!
//! ```text
//! <storage-root>/.pkgstore-db.json
//!   {"names":["pkg-a","@scope/pkg-b"],"secret":"<hex>"}
//! ```
//!
//! The index is advisory: it can be rebuilt from the manifests on disk. It
//! is still guarded against being overwritten when it cannot be read, since
//! an operator may want to recover the damaged file by hand.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::atomic::AtomicWriter;
use crate::config::ConfigProvider;
use crate::error::{StorageError, StorageResult};

/// File name of the index, inside the storage root.
pub const INDEX_FILE_NAME: &str = ".pkgstore-db.json";

/// Persisted form of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Package names in publish order, without duplicates.
    #[serde(default, alias = "list")]
    pub names: Vec<String>,

    /// Registry secret.
    #[serde(default)]
    pub secret: String,
}

/// In-memory package index backed by a JSON file.
#[derive(Debug)]
pub struct PackageIndex {
    path: PathBuf,
    record: IndexRecord,
    /// Set when the file existed but could not be read; never cleared.
    locked: bool,
    writer: AtomicWriter,
}

impl PackageIndex {
    /// Load the index from the configured storage root and settle its secret.
    ///
    /// The result is written back once; a failed write is logged, not returned.
    pub fn load(config: &dyn ConfigProvider) -> StorageResult<Self> {
        let root = config.storage_root().ok_or_else(|| StorageError::Config {
            message: "no storage root configured".to_string(),
        })?;
        let path = config.resolve_path(root).join(INDEX_FILE_NAME);

        let mut index = Self::open(path);
        index.record.secret = config.check_secret_key(&index.record.secret);

        if let Err(e) = index.sync() {
            warn!(path = %index.path.display(), error = %e, "could not persist package index at startup");
        }
        Ok(index)
    }

    /// Read the index at `path` without touching the secret or persisting anything.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (record, locked) = fetch_record(&path);
        Self {
            path,
            record,
            locked,
            writer: AtomicWriter::new(),
        }
    }

    /// Add a package name. Existing names are left alone and nothing is written.
    pub fn add(&mut self, name: &str) -> StorageResult<()> {
        if self.contains(name) {
            return Ok(());
        }
        self.record.names.push(name.to_string());
        debug!(name, "added package to index");
        self.sync()
    }

    /// Remove a package name. The index is written even when the name was absent.
    pub fn remove(&mut self, name: &str) -> StorageResult<()> {
        if let Some(pos) = self.record.names.iter().position(|n| n == name) {
            self.record.names.remove(pos);
            debug!(name, "removed package from index");
        }
        self.sync()
    }

    /// Snapshot of the package names, in publish order.
    pub fn list(&self) -> Vec<String> {
        self.record.names.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.record.names.iter().any(|n| n == name)
    }

    pub fn secret(&self) -> &str {
        &self.record.secret
    }

    /// Whether index writes are refused for the lifetime of this instance.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the whole index.
    pub fn sync(&self) -> StorageResult<()> {
        if self.locked {
            error!(
                path = %self.path.display(),
                "package index is locked, check the error printed during startup to prevent data loss"
            );
            return Err(StorageError::Locked {
                path: self.path.clone(),
            });
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::io("create directory", parent, e))?;
        }

        let json = serde_json::to_vec(&self.record).map_err(|e| StorageError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        self.writer.write_blocking(&self.path, &json)
    }
}

/// Returns the record and whether index writes must be refused.
fn fetch_record(path: &Path) -> (IndexRecord, bool) {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no package index yet, starting empty");
            return (IndexRecord::default(), false);
        }
        Err(e) => {
            error!(
                path = %path.display(),
                error = %e,
                "failed to read package index, index writes are disabled until restart"
            );
            return (IndexRecord::default(), true);
        }
    };

    // A literal `null` document counts as empty rather than corrupt.
    match serde_json::from_str::<Option<IndexRecord>>(&content) {
        Ok(record) => {
            let mut record = record.unwrap_or_default();
            dedup_names(&mut record.names);
            (record, false)
        }
        Err(e) => {
            error!(
                path = %path.display(),
                error = %e,
                "package index is corrupted (invalid JSON), index writes are disabled until restart"
            );
            (IndexRecord::default(), true)
        }
    }
}

/// Drop repeated names, keeping the first occurrence.
fn dedup_names(names: &mut Vec<String>) {
    let mut seen = HashSet::with_capacity(names.len());
    names.retain(|name| seen.insert(name.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_empty() -> (PackageIndex, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let index = PackageIndex::open(temp_dir.path().join(INDEX_FILE_NAME));
        (index, temp_dir)
    }

    #[test]
    fn test_add_is_idempotent() {
        let (mut index, _dir) = open_empty();

        index.add("left-pad").unwrap();
        index.add("left-pad").unwrap();

        assert_eq!(index.list(), vec!["left-pad".to_string()]);
    }

    #[test]
    fn test_add_keeps_publish_order() {
        let (mut index, _dir) = open_empty();

        index.add("zeta").unwrap();
        index.add("alpha").unwrap();
        index.add("@scope/mid").unwrap();

        assert_eq!(index.list(), vec!["zeta", "alpha", "@scope/mid"]);
    }

    #[test]
    fn test_remove_absent_name_still_syncs() {
        let (mut index, _dir) = open_empty();
        index.add("a").unwrap();
        std::fs::remove_file(index.path()).unwrap();

        index.remove("not-there").unwrap();

        assert_eq!(index.list(), vec!["a"]);
        assert!(index.path().exists(), "remove should always resync");
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let (mut index, _dir) = open_empty();
        index.add("a").unwrap();

        let mut snapshot = index.list();
        snapshot.push("b".to_string());

        assert_eq!(index.list(), vec!["a"]);
    }

    #[test]
    fn test_persisted_format() {
        let (mut index, _dir) = open_empty();
        index.add("a").unwrap();

        let raw = std::fs::read_to_string(index.path()).unwrap();
        assert_eq!(raw, r#"{"names":["a"],"secret":""}"#);
    }

    #[test]
    fn test_legacy_list_field() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(INDEX_FILE_NAME);
        std::fs::write(&path, r#"{"list":["old-pkg"],"secret":"s3cret"}"#).unwrap();

        let index = PackageIndex::open(&path);

        assert!(!index.is_locked());
        assert_eq!(index.list(), vec!["old-pkg"]);
        assert_eq!(index.secret(), "s3cret");
    }

    #[test]
    fn test_null_document_is_empty_not_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(INDEX_FILE_NAME);
        std::fs::write(&path, "null").unwrap();

        let index = PackageIndex::open(&path);

        assert!(!index.is_locked());
        assert!(index.list().is_empty());
    }

    #[test]
    fn test_unreadable_file_locks_index() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(INDEX_FILE_NAME);
        // A directory where the file should be cannot be read as a file.
        std::fs::create_dir(&path).unwrap();

        let mut index = PackageIndex::open(&path);

        assert!(index.is_locked());
        assert!(matches!(
            index.add("x"),
            Err(StorageError::Locked { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_on_disk_are_collapsed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(INDEX_FILE_NAME);
        std::fs::write(&path, r#"{"names":["a","b","a","c","b"],"secret":""}"#).unwrap();

        let mut index = PackageIndex::open(&path);
        assert_eq!(index.list(), vec!["a", "b", "c"]);

        index.remove("a").unwrap();
        assert!(!index.contains("a"));
        assert_eq!(PackageIndex::open(&path).list(), vec!["b", "c"]);
    }

    #[test]
    fn test_write_failure_is_io_and_does_not_lock() {
        let temp_dir = TempDir::new().unwrap();
        let sub = temp_dir.path().join("sub");
        let mut index = PackageIndex::open(sub.join("db.json"));
        assert!(!index.is_locked());

        // The parent directory cannot be created over a regular file.
        std::fs::write(&sub, b"not a directory").unwrap();

        let err = index.add("a").unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }), "{:?}", err);
        assert!(!index.is_locked());
        assert_eq!(std::fs::read(&sub).unwrap(), b"not a directory");
    }
}
