//! Network boundary.
//!
//! The wire protocol of the relay/CDN lives outside this crate; the
//! orchestrator only needs byte streams in and out.

#[cfg(any(test, feature = "mock"))]
mod mock;

#[cfg(any(test, feature = "mock"))]
pub use self::mock::{DeliveryGate, MockRelay};

use crate::descriptor::{DownloadDescriptor, Variant};
use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use mirage_storage::FileHash;
use std::pin::Pin;

/// Chunks of a file in transit.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send + 'static>>;

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Digest of the bytes to fetch (the alternate's own digest for
    /// alternates).
    pub hash: FileHash,
    /// Hash originally requested.
    pub source: FileHash,
    pub variant: Variant,
    pub url: Option<String>,
}

impl From<&DownloadDescriptor> for FetchRequest {
    fn from(download: &DownloadDescriptor) -> Self {
        Self {
            hash: download.expected,
            source: download.hash,
            variant: download.variant,
            url: download.url.clone(),
        }
    }
}

/// Moves file contents to and from the relay service.
///
/// Implementations report a missing file as
/// [`NotFoundOnServer`](crate::error::ErrorKind::NotFoundOnServer) and
/// connection problems as [`Network`](crate::error::ErrorKind::Network),
/// either from the call itself or as an item of the stream.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<ByteStream>;

    /// Upload `data` as `hash`. Returns once the relay has accepted all of it.
    async fn push(&self, hash: &FileHash, variant: Variant, data: ByteStream) -> Result<()>;
}
