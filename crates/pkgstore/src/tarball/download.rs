use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

const CHUNK_SIZE: usize = 64 * 1024;

/// Source for one tarball download.
///
/// The content length is taken from the open handle, so it matches the file
/// as it was when the download started. After [`abort`](Self::abort) reads
/// return end-of-file.
#[derive(Debug)]
pub struct TarballDownload {
    path: PathBuf,
    file: Option<fs::File>,
    content_length: u64,
}

impl TarballDownload {
    pub(crate) async fn open(path: PathBuf) -> StorageResult<Self> {
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::io("open tarball", &path, e))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| StorageError::io("stat tarball", &path, e))?;

        debug!(path = %path.display(), bytes = metadata.len(), "download opened");
        Ok(Self {
            path,
            file: Some(file),
            content_length: metadata.len(),
        })
    }

    /// Size in bytes at the time the file was opened.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the download and close the file. No bytes are delivered afterwards.
    pub fn abort(&mut self) {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), "download aborted");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.file.is_none()
    }

    /// Copy the whole tarball into `writer`, returning the number of bytes copied.
    pub async fn copy_to<W>(mut self, writer: &mut W) -> StorageResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        tokio::io::copy(&mut self, writer)
            .await
            .map_err(|e| StorageError::io("read tarball", &self.path, e))
    }

    /// Turn the download into a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = StorageResult<Bytes>> + Send {
        stream::try_unfold(self, |mut source| async move {
            let mut chunk = BytesMut::with_capacity(CHUNK_SIZE);
            let n = source
                .read_buf(&mut chunk)
                .await
                .map_err(|e| StorageError::io("read tarball", &source.path, e))?;
            if n == 0 {
                return Ok(None);
            }
            Ok::<_, StorageError>(Some((chunk.freeze(), source)))
        })
    }
}

impl AsyncRead for TarballDownload {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}
