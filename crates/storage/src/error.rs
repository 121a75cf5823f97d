//! Cache errors.

use crate::FileHash;
use derive_more::{Display, Error};
use mirage_compress::error::{Error as CompressionError, ErrorKind as CompressionErrorKind};
use std::io::Error as IoError;
use std::path::{Path, PathBuf};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No entry exists for the hash.
    #[display("not cached: {_0}")]
    NotFound(#[error(not(source))] FileHash),
    /// Bytes offered for a hash digest to something else. Nothing was written.
    #[display("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: FileHash, actual: FileHash },
    /// A stored entry no longer matches its hash. It has been removed.
    #[display("corrupt cache entry removed: {_0}")]
    Corrupt(#[error(not(source))] FileHash),
    /// String is not a valid hex digest.
    #[display("invalid hash: {_0:?}")]
    InvalidHash(#[error(not(source))] String),
    /// Cache root is unusable (relative, or not a directory).
    #[display("invalid cache root: {}", _0.display())]
    InvalidRoot(#[error(not(source))] PathBuf),
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    #[display("I/O error: {_0}")]
    Io(IoError),
    #[display("compression error: {_0}")]
    Compression(CompressionErrorKind),
    /// A blocking task panicked or was cancelled by the runtime.
    #[display("background task failed")]
    Background,
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
impl ErrorKind {
    /// Convert a compression error into a storage error, keeping the compress
    /// crate's frame as a child in the error tree.
    #[track_caller]
    pub fn compression(err: CompressionError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Compression(inner))
    }

    pub(crate) fn io(err: IoError, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }

    /// Transient filesystem trouble; the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Background)
    }
}
