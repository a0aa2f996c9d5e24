//! Error types for the storage engine.

use std::io;
use std::path::{Path, PathBuf};

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Target file already exists (manifest create, tarball upload).
    #[error("file exists: {}", path.display())]
    FileExists { path: PathBuf },

    /// Manifest, tarball or package directory does not exist.
    #[error("no such package available: {}", path.display())]
    NotFound { path: PathBuf },

    /// Manifest lock is held by someone else.
    #[error("resource temporarily unavailable: {}", path.display())]
    ServiceUnavailable { path: PathBuf },

    /// Stored JSON could not be parsed.
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// Index writes are refused because the index file was unreadable at startup.
    #[error(
        "package index {} is locked: it could not be read during startup, check the logs before restarting",
        path.display()
    )]
    Locked { path: PathBuf },

    /// Generic filesystem failure.
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl StorageError {
    /// Wrap an I/O error, keeping `NotFound` as its own variant.
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { op, path, source },
        }
    }

    /// Short machine-readable code, compatible with the registry's error codes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::FileExists { .. } => "EEXISTS",
            Self::NotFound { .. } => "ENOENT",
            Self::ServiceUnavailable { .. } => "EAGAIN",
            Self::Parse { .. } => "EPARSE",
            Self::Locked { .. } => "ELOCKED",
            Self::Io { .. } => "EIO",
            Self::Config { .. } => "ECONFIG",
        }
    }

    /// HTTP status the API layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::FileExists { .. } => 409,
            Self::NotFound { .. } => 404,

            // Lock contention is reported as a plain server error, not 503.
            Self::ServiceUnavailable { .. } => 500,

            Self::Parse { .. } => 500,
            Self::Locked { .. } => 500,
            Self::Io { .. } => 500,
            Self::Config { .. } => 500,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }

    /// Whether this is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
