use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::atomic::{temp_path, AtomicWriter, TempFileGuard};
use crate::error::{StorageError, StorageResult};

/// Sink for one tarball upload.
///
/// Bytes go to a temp file in the package directory. [`finish`](Self::finish)
/// promotes it to the destination, [`abort`](Self::abort) deletes it.
/// Dropping an upload that was neither finished nor aborted, including a
/// `finish` or `abort` future dropped before completion, deletes the temp
/// file as well.
#[derive(Debug)]
pub struct TarballUpload {
    dest: PathBuf,
    // Declared before `temp` so the handle closes before the guard unlinks.
    file: Option<fs::File>,
    temp: TempFileGuard,
    bytes_written: u64,
    writer: AtomicWriter,
}

impl TarballUpload {
    pub(crate) async fn open(dest: PathBuf, writer: AtomicWriter) -> StorageResult<Self> {
        // Created on the blocking pool together with its guard: if this
        // future is dropped first, the guard is dropped with the task output.
        let guard = TempFileGuard::new(temp_path(&dest));
        let (file, temp) = tokio::task::spawn_blocking(move || create_temp(guard))
            .await
            .map_err(|e| StorageError::io("create temp file", &dest, io::Error::other(e)))??;

        debug!(path = %dest.display(), temp = %temp.path().display(), "upload opened");
        Ok(Self {
            dest,
            file: Some(fs::File::from_std(file)),
            temp,
            bytes_written: 0,
            writer,
        })
    }

    /// Final location of the tarball.
    pub fn destination(&self) -> &Path {
        &self.dest
    }

    /// Where the bytes are buffered until [`finish`](Self::finish).
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append a chunk.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> StorageResult<()> {
        self.write_all(chunk)
            .await
            .map_err(|e| StorageError::io("write tarball", self.temp.path(), e))
    }

    /// Close the temp file and rename it onto the destination.
    ///
    /// Taking `self` means no bytes can arrive after this point. If the
    /// rename fails, the temp file is removed and the error returned.
    pub async fn finish(mut self) -> StorageResult<()> {
        if let Some(mut file) = self.file.take() {
            let flushed = flush_and_sync(&mut file).await;
            drop(file.into_std().await);
            flushed.map_err(|e| StorageError::io("write tarball", self.temp.path(), e))?;
        }

        self.writer
            .rename_into_place(self.temp.path(), &self.dest)
            .await?;
        self.temp.disarm();

        debug!(
            path = %self.dest.display(),
            bytes = self.bytes_written,
            "upload finished"
        );
        Ok(())
    }

    /// Close and delete the temp file. The destination is never touched.
    pub async fn abort(mut self) -> StorageResult<()> {
        if let Some(file) = self.file.take() {
            // Wait for pending writes so the unlink below is the last word.
            drop(file.into_std().await);
        }

        match fs::remove_file(self.temp.path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io("remove temp file", self.temp.path(), e)),
        }
        self.temp.disarm();
        debug!(path = %self.dest.display(), "upload aborted");
        Ok(())
    }
}

fn create_temp(temp: TempFileGuard) -> StorageResult<(std::fs::File, TempFileGuard)> {
    let file = match std::fs::File::create(temp.path()) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = temp.path().parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::io("create directory", parent, e))?;
            }
            std::fs::File::create(temp.path())
        }
        result => result,
    }
    .map_err(|e| StorageError::io("create temp file", temp.path(), e))?;
    Ok((file, temp))
}

async fn flush_and_sync(file: &mut fs::File) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

impl AsyncWrite for TarballUpload {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(closed()));
        };
        let poll = Pin::new(file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.bytes_written += n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Err(closed())),
        }
    }

    /// Flushes only; the temp file stays open until `finish` or `abort`.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "upload already closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_counts_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let mut upload = TarballUpload::open(temp_dir.path().join("a.tgz"), AtomicWriter::new())
            .await
            .unwrap();

        upload.write_chunk(b"abc").await.unwrap();
        upload.write_chunk(b"defg").await.unwrap();

        assert_eq!(upload.bytes_written(), 7);
        upload.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("new-pkg").join("new-pkg-1.0.0.tgz");

        let mut upload = TarballUpload::open(dest.clone(), AtomicWriter::new())
            .await
            .unwrap();
        assert_eq!(upload.destination(), dest.as_path());
        assert_eq!(upload.temp_path().parent(), dest.parent());
        upload.write_chunk(b"x").await.unwrap();
        upload.finish().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_drop_discards_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let upload = TarballUpload::open(temp_dir.path().join("a.tgz"), AtomicWriter::new())
            .await
            .unwrap();
        let temp = upload.temp_path().to_path_buf();
        assert!(temp.exists());

        drop(upload);

        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_failed_rename_discards_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("a.tgz");
        let mut upload = TarballUpload::open(dest.clone(), AtomicWriter::new())
            .await
            .unwrap();
        upload.write_chunk(b"x").await.unwrap();
        let temp = upload.temp_path().to_path_buf();

        // A non-empty directory at the destination makes the rename fail.
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("keep"), b"").unwrap();

        assert!(upload.finish().await.is_err());
        assert!(!temp.exists());
        assert!(dest.join("keep").exists());
    }
}
