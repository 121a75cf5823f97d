//! Housekeeping over the whole cache: sizing, eviction and verification.

use crate::FileHash;
use crate::cache::ContentCache;
use crate::entry::CacheEntry;
use crate::error::{Error, ErrorKind, Result};
use futures::TryStreamExt;
use std::collections::BTreeSet;
use tracing::instrument;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub removed: usize,
    pub freed: u64,
    /// Size of the cache once eviction finished.
    pub remaining: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Verification {
    pub checked: usize,
    /// Entries that failed their digest check and were removed.
    pub corrupt: Vec<FileHash>,
}
impl Verification {
    pub fn is_healthy(&self) -> bool {
        self.corrupt.is_empty()
    }
}

impl ContentCache {
    /// Disk space used by all entries, as stored.
    pub async fn total_size(&self) -> Result<u64> {
        self.enumerate().try_fold(0, |total, entry| async move { Ok::<_, Error>(total + entry.size) }).await
    }

    /// Evict entries, oldest first, until the cache fits in `limit` bytes.
    #[instrument(skip(self))]
    pub async fn evict_to(&self, limit: u64) -> Result<Eviction> {
        let mut entries: Vec<CacheEntry> = self.enumerate().try_collect().await?;
        let mut eviction = Eviction { remaining: entries.iter().map(|entry| entry.size).sum(), ..Default::default() };
        entries.sort_by_key(|entry| entry.modified);

        for entry in entries {
            if eviction.remaining <= limit {
                break;
            }
            match self.remove(&entry.hash).await {
                Ok(()) => {
                    eviction.removed += 1;
                    eviction.freed += entry.size;
                    eviction.remaining = eviction.remaining.saturating_sub(entry.size);
                },
                // Someone else removed it first.
                Err(e) if matches!(&*e, ErrorKind::NotFound(_)) => {
                    eviction.remaining = eviction.remaining.saturating_sub(entry.size);
                },
                Err(e) => return Err(e),
            }
        }
        tracing::info!(removed = eviction.removed, freed = eviction.freed, "Evicted cache entries");
        Ok(eviction)
    }

    /// Read back every entry and check it against its hash.
    #[instrument(skip(self))]
    pub async fn verify_all(&self) -> Result<Verification> {
        let hashes: BTreeSet<FileHash> = self.enumerate().map_ok(|entry| entry.hash).try_collect().await?;
        let mut verification = Verification::default();
        for hash in hashes {
            match self.read(&hash).await {
                Ok(_) => verification.checked += 1,
                Err(e) if matches!(&*e, ErrorKind::Corrupt(_)) => {
                    verification.checked += 1;
                    verification.corrupt.push(hash);
                },
                Err(e) if matches!(&*e, ErrorKind::NotFound(_)) => {},
                Err(e) => return Err(e),
            }
        }
        if !verification.is_healthy() {
            tracing::warn!(corrupt = verification.corrupt.len(), "Removed corrupt cache entries");
        }
        Ok(verification)
    }
}
