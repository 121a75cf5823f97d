//! What to transfer.
//!
//! A [`TransferDescriptor`] is created from a server-issued
//! [`TransferTicket`] (downloads) or a locally held file (uploads), and is
//! immutable once submitted apart from the upload's discovered size and skip
//! flag.

use crate::state::SkipReason;
use derive_more::Display;
use mirage_policy::Decision;
use mirage_storage::FileHash;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Which rendition of a file is moved.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    #[display("source")]
    Source,
    #[display("alternate")]
    Alternate,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    #[display("download")]
    Download,
    #[display("upload")]
    Upload,
}

/// Server-compressed rendition offered alongside a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateTicket {
    /// Digest of the alternate's own bytes.
    pub hash: FileHash,
    pub size: u64,
    pub url: Option<String>,
}

/// Server-issued description of a downloadable hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTicket {
    pub hash: FileHash,
    pub exists: bool,
    pub forbidden: bool,
    pub size: u64,
    /// Direct download location, bypassing the relay's default route.
    pub url: Option<String>,
    pub alternate: Option<AlternateTicket>,
}
impl TransferTicket {
    /// Ticket for a file the server holds, with no alternate.
    pub fn available(hash: FileHash, size: u64) -> Self {
        Self { hash, exists: true, forbidden: false, size, url: None, alternate: None }
    }

    pub fn with_alternate(mut self, hash: FileHash, size: u64) -> Self {
        self.alternate = Some(AlternateTicket { hash, size, url: None });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDescriptor {
    /// Hash the pairing layer asked for (the source file's digest).
    pub hash: FileHash,
    pub variant: Variant,
    /// Digest the received bytes must have; differs from `hash` for an
    /// alternate.
    pub expected: FileHash,
    /// Server-reported size of the chosen variant.
    pub size: u64,
    /// Server-reported size of the source file.
    pub raw_size: u64,
    pub url: Option<String>,
    pub exists: bool,
    pub forbidden: bool,
}

impl DownloadDescriptor {
    /// Build a descriptor for the selector's `decision`.
    ///
    /// When an alternate was chosen but the ticket doesn't offer one, the
    /// source is downloaded instead.
    pub fn from_ticket(ticket: TransferTicket, decision: Decision) -> Self {
        let TransferTicket { hash, exists, forbidden, size, url, alternate } = ticket;
        match (decision, alternate) {
            (Decision::FetchAlternate, Some(alternate)) => Self {
                hash,
                variant: Variant::Alternate,
                expected: alternate.hash,
                size: alternate.size,
                raw_size: size,
                url: alternate.url,
                exists,
                forbidden,
            },
            _ => Self {
                hash,
                variant: Variant::Source,
                expected: hash,
                size,
                raw_size: size,
                url,
                exists,
                forbidden,
            },
        }
    }

    pub fn can_be_transferred(&self) -> bool {
        self.skip_reason().is_none()
    }

    fn skip_reason(&self) -> Option<SkipReason> {
        if !self.exists {
            Some(SkipReason::NotOnServer)
        } else if self.forbidden {
            Some(SkipReason::Forbidden)
        } else if self.size == 0 {
            Some(SkipReason::Empty)
        } else {
            None
        }
    }
}

/// A locally held file a peer asked for.
///
/// Its size is unknown until the file is inspected when the upload starts.
/// Cancelling the token it was created from cancels the upload; cancelling
/// the upload leaves that token alone.
#[derive(Debug)]
pub struct UploadDescriptor {
    pub hash: FileHash,
    pub variant: Variant,
    path: PathBuf,
    total: OnceLock<u64>,
    skip: AtomicBool,
    cancel: CancellationToken,
}

impl UploadDescriptor {
    pub fn new(hash: FileHash, variant: Variant, path: impl Into<PathBuf>, parent: &CancellationToken) -> Self {
        Self {
            hash,
            variant,
            path: path.into(),
            total: OnceLock::new(),
            skip: AtomicBool::new(false),
            cancel: parent.child_token(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes, once the local file has been inspected.
    pub fn total(&self) -> Option<u64> {
        self.total.get().copied()
    }

    pub(crate) fn set_total(&self, total: u64) {
        _ = self.total.set(total);
    }

    /// Ask for the upload to be skipped. Only effective before it starts.
    pub fn skip(&self) {
        self.skip.store(true, Ordering::Release);
    }

    pub fn is_skipped(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn can_be_transferred(&self) -> bool {
        !self.is_skipped()
    }
}

#[derive(Debug)]
pub enum TransferDescriptor {
    Download(DownloadDescriptor),
    Upload(UploadDescriptor),
}

impl TransferDescriptor {
    pub fn hash(&self) -> &FileHash {
        match self {
            Self::Download(download) => &download.hash,
            Self::Upload(upload) => &upload.hash,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Download(_) => Direction::Download,
            Self::Upload(_) => Direction::Upload,
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            Self::Download(download) => download.variant,
            Self::Upload(upload) => upload.variant,
        }
    }

    /// Total bytes to move, if known yet.
    pub fn total(&self) -> Option<u64> {
        match self {
            Self::Download(download) => Some(download.size),
            Self::Upload(upload) => upload.total(),
        }
    }

    /// Admission predicate, evaluated once when a slot is available.
    pub fn can_be_transferred(&self) -> bool {
        self.skip_reason().is_none()
    }

    pub(crate) fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Download(download) => download.skip_reason(),
            Self::Upload(upload) => upload.is_skipped().then_some(SkipReason::Requested),
        }
    }
}

impl From<DownloadDescriptor> for TransferDescriptor {
    fn from(download: DownloadDescriptor) -> Self {
        Self::Download(download)
    }
}

impl From<UploadDescriptor> for TransferDescriptor {
    fn from(upload: UploadDescriptor) -> Self {
        Self::Upload(upload)
    }
}
