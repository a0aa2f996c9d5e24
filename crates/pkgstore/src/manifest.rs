//! Package manifest storage.
//!
//! Updates run under the package's manifest lock:
//!
//! 1. lock `package.json` and read it
//! 2. hand the document to the update handler
//! 3. write the transformed result (temp file + rename)
//! 4. release the lock, whatever happened in 2 and 3
//!
//! A busy lock fails the update right away with
//! [`StorageError::ServiceUnavailable`]; callers decide whether to retry.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::lock::{LockError, LockService};
use crate::store::PackageStore;

/// Held manifest lock. Released explicitly, or in the background on drop.
struct ManifestLock {
    locks: Arc<dyn LockService>,
    path: PathBuf,
    released: bool,
}

impl ManifestLock {
    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.locks.unlock(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "failed to unlock manifest");
        }
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // The update future was cancelled or panicked mid-flight.
        let locks = Arc::clone(&self.locks);
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = locks.unlock(&path).await {
                        warn!(path = %path.display(), error = %e, "failed to unlock manifest");
                    }
                });
            }
            Err(_) => {
                warn!(path = %path.display(), "manifest lock dropped outside a runtime, not released");
            }
        }
    }
}

impl PackageStore {
    /// Write a new manifest. Fails with [`StorageError::FileExists`] if there is one.
    pub async fn create(&self, document: &Value) -> StorageResult<()> {
        let path = self.manifest_path();
        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io("check manifest", &path, e))?;
        if exists {
            return Err(StorageError::FileExists { path });
        }

        self.writer.write(&path, &encode_manifest(document)?).await?;
        debug!(path = %path.display(), "created manifest");
        Ok(())
    }

    /// Overwrite the manifest without checks or locking.
    pub async fn save(&self, document: &Value) -> StorageResult<()> {
        let path = self.manifest_path();
        self.writer.write(&path, &encode_manifest(document)?).await
    }

    /// Read and parse the manifest.
    pub async fn read(&self) -> StorageResult<Value> {
        let path = self.manifest_path();
        let content = fs::read(&path)
            .await
            .map_err(|e| StorageError::io("read manifest", &path, e))?;

        serde_json::from_slice(&content).map_err(|e| StorageError::Parse {
            path,
            message: e.to_string(),
        })
    }

    /// Locked read-modify-write that saves the handler's result as is.
    pub async fn update<H, HF, E>(&self, handler: H) -> Result<(), E>
    where
        H: FnOnce(Value) -> HF,
        HF: Future<Output = Result<Value, E>>,
        E: From<StorageError>,
    {
        self.update_with(handler, |document| document, move |document| async move {
            self.save(&document).await.map_err(E::from)
        })
        .await
    }

    /// Locked read-modify-write.
    ///
    /// `handler` gets the current manifest and returns the updated one (or
    /// an error, which aborts the update). On success `write` receives
    /// `transform(updated)`. The lock is released before this returns, on
    /// every path; an unlock failure is logged and does not change the result.
    pub async fn update_with<H, HF, T, W, WF, E>(
        &self,
        handler: H,
        transform: T,
        write: W,
    ) -> Result<(), E>
    where
        H: FnOnce(Value) -> HF,
        HF: Future<Output = Result<Value, E>>,
        T: FnOnce(Value) -> Value,
        W: FnOnce(Value) -> WF,
        WF: Future<Output = Result<(), E>>,
        E: From<StorageError>,
    {
        let (lock, document) = self.lock_manifest().await?;

        let outcome: Result<(), E> = async {
            let updated = handler(document).await?;
            write(transform(updated)).await
        }
        .await;

        lock.release().await;
        outcome
    }

    async fn lock_manifest(&self) -> StorageResult<(ManifestLock, Value)> {
        let path = self.manifest_path();
        match self.locks.lock_and_read(&path).await {
            Ok(document) => {
                debug!(path = %path.display(), "locked manifest for update");
                let lock = ManifestLock {
                    locks: Arc::clone(&self.locks),
                    path,
                    released: false,
                };
                Ok((lock, document))
            }
            Err(LockError::Busy) => Err(StorageError::ServiceUnavailable { path }),
            Err(LockError::NotFound) => Err(StorageError::NotFound { path }),
            Err(LockError::Io(e)) => Err(StorageError::io("lock manifest", &path, e)),
            Err(LockError::Parse(e)) => Err(StorageError::Parse {
                path,
                message: e.to_string(),
            }),
        }
    }
}

/// Pretty JSON, tab indented.
fn encode_manifest(document: &Value) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    document
        .serialize(&mut serializer)
        .map_err(|e| StorageError::Parse {
            path: PathBuf::from(crate::store::MANIFEST_FILE_NAME),
            message: e.to_string(),
        })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (PackageStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = PackageStore::new(temp_dir.path().join("pkg"));
        (store, temp_dir)
    }

    #[test]
    fn test_manifest_is_tab_indented() {
        let bytes = encode_manifest(&json!({"name": "pkg"})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "{\n\t\"name\": \"pkg\"\n}");
    }

    #[tokio::test]
    async fn test_create_makes_package_directory() {
        let (store, _dir) = create_test_store();

        store.create(&json!({"name": "pkg"})).await.unwrap();

        assert!(store.manifest_path().exists());
    }

    #[tokio::test]
    async fn test_save_overwrites_without_checks() {
        let (store, _dir) = create_test_store();
        store.create(&json!({"name": "pkg"})).await.unwrap();

        store.save(&json!({"name": "pkg", "x": 1})).await.unwrap();

        assert_eq!(store.read().await.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn test_read_corrupt_manifest() {
        let (store, _dir) = create_test_store();
        std::fs::create_dir_all(store.path()).unwrap();
        std::fs::write(store.manifest_path(), "{\"name\":").unwrap();

        let err = store.read().await.unwrap_err();
        assert!(matches!(err, StorageError::Parse { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_update_corrupt_manifest_is_parse_error() {
        let (store, _dir) = create_test_store();
        std::fs::create_dir_all(store.path()).unwrap();
        std::fs::write(store.manifest_path(), "garbage").unwrap();

        let result = store
            .update(|doc| async move { Ok::<_, StorageError>(doc) })
            .await;

        assert!(matches!(result, Err(StorageError::Parse { .. })));
        assert!(!crate::lock::lock_path(&store.manifest_path()).exists());
    }

    #[tokio::test]
    async fn test_transform_applies_before_write() {
        let (store, _dir) = create_test_store();
        store.create(&json!({"name": "pkg"})).await.unwrap();
        let writer = &store;

        store
            .update_with(
                |mut doc| async move {
                    doc["version"] = json!("1.0.0");
                    Ok::<_, StorageError>(doc)
                },
                |mut doc| {
                    doc["_rev"] = json!("2-abc");
                    doc
                },
                move |doc| async move { writer.save(&doc).await },
            )
            .await
            .unwrap();

        let doc = store.read().await.unwrap();
        assert_eq!(doc["version"], "1.0.0");
        assert_eq!(doc["_rev"], "2-abc");
    }

    #[tokio::test]
    async fn test_cancelled_update_releases_lock() {
        let (store, _dir) = create_test_store();
        store.create(&json!({"name": "pkg"})).await.unwrap();

        let stalled = store.update(|doc| async move {
            std::future::pending::<()>().await;
            Ok::<_, StorageError>(doc)
        });
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), stalled).await;
        assert!(timed_out.is_err());

        // Release happens on a spawned task.
        let mut released = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let attempt = store
                .update(|doc| async move { Ok::<_, StorageError>(doc) })
                .await;
            if attempt.is_ok() {
                released = true;
                break;
            }
        }
        assert!(released, "lock should be released after cancellation");
    }
}
