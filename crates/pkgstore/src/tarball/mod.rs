//! Tarball streaming in and out of a package directory.
//!
//! Uploads land in a temp file next to their destination and are renamed
//! into place by [`TarballUpload::finish`]; until then the destination is
//! untouched. Downloads read the stored file directly.

mod download;
mod upload;

pub use download::TarballDownload;
pub use upload::TarballUpload;

use tokio::fs;

use crate::error::{StorageError, StorageResult};
use crate::store::PackageStore;

impl PackageStore {
    /// Start uploading tarball `name`.
    ///
    /// The returned sink already has its temp file open. The existence
    /// check is not atomic with the final rename: two concurrent uploads of
    /// the same name can both pass it, and the later rename wins.
    pub async fn begin_upload(&self, name: &str) -> StorageResult<TarballUpload> {
        let dest = self.file_path(name);
        let exists = fs::try_exists(&dest)
            .await
            .map_err(|e| StorageError::io("check tarball", &dest, e))?;
        if exists {
            return Err(StorageError::FileExists { path: dest });
        }

        TarballUpload::open(dest, self.writer).await
    }

    /// Start downloading tarball `name`.
    pub async fn begin_download(&self, name: &str) -> StorageResult<TarballDownload> {
        TarballDownload::open(self.file_path(name)).await
    }
}
