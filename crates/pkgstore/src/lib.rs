//! Local filesystem storage for a package registry.
//!
//! This crate keeps the locally published packages of a registry on disk:
//!
//! - A package index: publish-ordered package names plus the registry secret
//! - Package manifests (`package.json`), updated under a per-package lock
//! - Tarballs, streamed in through a temp file and streamed out directly
//!
//! Every write goes through a temp file and a rename, so a crash never leaves
//! a half-written manifest or tarball behind. If the index file cannot be
//! read at startup, index writes are refused until restart instead of
//! overwriting it.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pkgstore::{LocalStorage, StorageConfig, StorageError};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = StorageConfig::from_yaml_file("/etc/registry/config.yaml")?;
//! let storage = LocalStorage::open(Arc::new(config))?;
//!
//! let store = storage
//!     .package_store("left-pad")
//!     .ok_or_else(|| anyhow::anyhow!("no storage configured for left-pad"))?;
//! store.create(&json!({"name": "left-pad", "versions": {}})).await?;
//! storage.add_package("left-pad")?;
//!
//! store
//!     .update(|mut manifest| async move {
//!         manifest["dist-tags"] = json!({"latest": "1.0.0"});
//!         Ok::<_, StorageError>(manifest)
//!     })
//!     .await?;
//!
//! let mut upload = store.begin_upload("left-pad-1.0.0.tgz").await?;
//! upload.write_chunk(b"...").await?;
//! upload.finish().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `PKGSTORE_STORAGE` | Storage root |
//! | `PKGSTORE_CONFIG_PATH` | Config file path; a relative storage root resolves against its directory |
//! | `PKGSTORE_SECRET` | Secret used when the index does not have one yet |

pub mod atomic;
pub mod config;
pub mod error;
pub mod index;
pub mod lock;
mod manifest;
pub mod storage;
pub mod store;
pub mod tarball;

// Re-export main types
pub use atomic::{AtomicWriter, RenameStrategy};
pub use config::{ConfigProvider, PackageSpec, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use index::{IndexRecord, PackageIndex, INDEX_FILE_NAME};
pub use lock::{FileLockService, LockError, LockService};
pub use storage::LocalStorage;
pub use store::{resolve_package_dir, PackageStore, MANIFEST_FILE_NAME};
pub use tarball::{TarballDownload, TarballUpload};
