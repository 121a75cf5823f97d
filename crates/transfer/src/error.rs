//! Transfer Error Types
//!
//! Every failed transfer resolves to one [`FailureClass`], which is what the
//! descriptor's terminal state records. The full `exn` error tree is logged
//! where the failure happens.

use derive_more::{Display, Error};
use mirage_storage::FileHash;
use std::path::PathBuf;

/// A transfer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The relay has no such file (or won't serve it).
    #[display("not available on server: {_0}")]
    NotFoundOnServer(#[error(not(source))] FileHash),
    /// Received bytes don't digest to the expected hash. Nothing was cached.
    #[display("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: FileHash, actual: FileHash },
    /// More bytes arrived than the transfer's advertised size.
    #[display("received more than the advertised {advertised} bytes")]
    Oversized { advertised: u64 },
    /// Stream ended before the advertised size was reached.
    #[display("transfer ended after {received} of {advertised} bytes")]
    Truncated { received: u64, advertised: u64 },
    /// Connection-level failure talking to the relay.
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Local file to upload couldn't be read.
    #[display("cannot read local file: {}", _0.display())]
    LocalFile(#[error(not(source))] PathBuf),
    /// The content cache failed underneath the transfer.
    #[display("cache error")]
    Cache,
    #[display("transfer cancelled")]
    Cancelled,
    #[display("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

impl ErrorKind {
    /// The failure class a terminal state records for this error.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::NotFoundOnServer(_) => FailureClass::NotFoundOnServer,
            Self::IntegrityMismatch { .. } => FailureClass::IntegrityMismatch,
            Self::Oversized { .. } | Self::Truncated { .. } | Self::Network(_) => FailureClass::Network,
            Self::LocalFile(_) | Self::Cache | Self::InvalidTransition { .. } => FailureClass::Local,
            Self::Cancelled => FailureClass::Cancelled,
        }
    }

    /// Returns `true` if retrying might succeed. The orchestrator never
    /// retries on its own; this is for callers deciding whether to resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Truncated { .. } | Self::Cache)
    }
}

/// Why a transfer failed, coarse enough to act on.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    #[display("not found on server")]
    NotFoundOnServer,
    #[display("integrity mismatch")]
    IntegrityMismatch,
    #[display("network")]
    Network,
    #[display("local I/O")]
    Local,
    #[display("cancelled")]
    Cancelled,
}
