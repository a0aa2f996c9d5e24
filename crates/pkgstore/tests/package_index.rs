//! Integration tests for the package index.

use std::sync::Arc;

use pkgstore::{
    LocalStorage, PackageIndex, StorageConfig, StorageError, INDEX_FILE_NAME,
};
use tempfile::TempDir;

#[test]
fn test_corrupt_index_is_never_overwritten() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("storage");
    std::fs::create_dir_all(&root).unwrap();
    let path = root.join(INDEX_FILE_NAME);
    let damaged = b"{\"names\":[\"a\",\"b\"";
    std::fs::write(&path, damaged).unwrap();

    let config = StorageConfig::new(&root).with_secret("configured");
    let mut index = PackageIndex::load(&config).unwrap();

    assert!(index.is_locked());
    assert!(index.list().is_empty());
    assert!(matches!(index.add("c"), Err(StorageError::Locked { .. })));
    assert!(matches!(index.remove("a"), Err(StorageError::Locked { .. })));
    assert!(matches!(index.sync(), Err(StorageError::Locked { .. })));

    assert_eq!(std::fs::read(&path).unwrap(), damaged);
}

#[test]
fn test_locked_index_reports_through_storage() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("storage");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join(INDEX_FILE_NAME), "not json").unwrap();

    let storage = LocalStorage::open(Arc::new(StorageConfig::new(&root))).unwrap();

    assert!(storage.is_index_locked());
    let err = storage.add_package("pkg").unwrap_err();
    assert_eq!(err.code(), "ELOCKED");
    assert!(!err.is_retryable());
}

#[test]
fn test_configured_secret_used_when_none_stored() {
    let temp_dir = TempDir::new().unwrap();
    let config = StorageConfig::new(temp_dir.path().join("storage")).with_secret("configured");

    let index = PackageIndex::load(&config).unwrap();
    assert_eq!(index.secret(), "configured");

    // Once persisted, the stored secret wins over a different configured one.
    let other = StorageConfig::new(temp_dir.path().join("storage")).with_secret("other");
    let reloaded = PackageIndex::load(&other).unwrap();
    assert_eq!(reloaded.secret(), "configured");
}

#[test]
fn test_load_upgrades_legacy_field_name() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("storage");
    std::fs::create_dir_all(&root).unwrap();
    let path = root.join(INDEX_FILE_NAME);
    std::fs::write(&path, r#"{"list":["old-pkg"],"secret":"s3cret"}"#).unwrap();

    let index = PackageIndex::load(&StorageConfig::new(&root)).unwrap();

    assert_eq!(index.list(), vec!["old-pkg"]);
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        r#"{"names":["old-pkg"],"secret":"s3cret"}"#
    );
}

#[test]
fn test_relative_storage_resolves_against_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    std::fs::write(&config_path, "storage: data\n").unwrap();

    let config = StorageConfig::from_yaml_file(&config_path).unwrap();
    let index = PackageIndex::load(&config).unwrap();

    assert_eq!(index.path(), temp_dir.path().join("data").join(INDEX_FILE_NAME));
    assert!(index.path().exists());
}

#[test]
fn test_no_temp_files_left_after_sync() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("storage");
    let mut index = PackageIndex::load(&StorageConfig::new(&root)).unwrap();

    for name in ["a", "b", "c"] {
        index.add(name).unwrap();
    }
    index.remove("b").unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(&root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    assert_eq!(PackageIndex::open(index.path()).list(), vec!["a", "c"]);
}
