//! Background compaction of cached entries.
//!
//! Compaction rewrites an uncompacted entry in compressed form to save disk
//! space. It never changes what [`ContentCache::read`] returns: the
//! compressed copy is decoded and checked against the entry's hash before it
//! replaces the original, and readers of that hash wait for the swap.

use crate::FileHash;
use crate::cache::ContentCache;
use crate::error::{ErrorKind, Result};
use async_stream::stream;
use exn::ResultExt;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt, TryStreamExt};
use mirage_compress::{Compression, Level};
use std::sync::Arc;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Entries smaller than this aren't worth compressing.
pub const DEFAULT_MIN_SIZE: u64 = 4 * 1024;
/// Compression is CPU-bound; keep the number of concurrent jobs small.
const MAX_CONCURRENT_COMPACTIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Compactor was configured without a codec.
    Disabled,
    /// Entry is already stored compressed.
    AlreadyCompacted,
    TooSmall,
    /// Compressed form wouldn't be smaller.
    NoGain,
    /// Nothing stored under the hash (it may have been evicted).
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compaction {
    Compacted { before: u64, after: u64 },
    Skipped(SkipReason),
}

/// Progress of [`Compactor::compact_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactEvent {
    Started,
    /// Number of uncompacted entries found.
    DiscoveryComplete(u64),
    Processed(FileHash, Compaction),
    Complete,
}

#[derive(Clone)]
pub struct Compactor {
    cache: Arc<ContentCache>,
    format: Compression,
    level: Level,
    min_size: u64,
}

impl Compactor {
    pub fn new(cache: Arc<ContentCache>, format: Compression) -> Self {
        Self { cache, format, level: Level::default(), min_size: DEFAULT_MIN_SIZE }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn format(&self) -> Compression {
        self.format
    }

    /// Compact one entry.
    ///
    /// Either the entry ends up compacted, or it's left exactly as it was.
    #[instrument(skip(self), fields(%hash, format = %self.format))]
    pub async fn compact(&self, hash: &FileHash) -> Result<Compaction> {
        if !self.format.is_compressed() {
            return Ok(Compaction::Skipped(SkipReason::Disabled));
        }
        let _guard = self.cache.lock_exclusive(hash).await;
        let Some((path, current, metadata)) = self.cache.find(hash).await? else {
            return Ok(Compaction::Skipped(SkipReason::Missing));
        };
        if current.is_compressed() {
            return Ok(Compaction::Skipped(SkipReason::AlreadyCompacted));
        }
        let before = metadata.len();
        if before < self.min_size {
            return Ok(Compaction::Skipped(SkipReason::TooSmall));
        }

        let original = fs::read(&path).await.map_err(|e| ErrorKind::io(e, &path))?;
        let (expected, format, level) = (*hash, self.format, self.level);
        let compressed = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            if FileHash::digest(&original) != expected {
                exn::bail!(ErrorKind::Corrupt(expected));
            }
            let compressed = format.compress_with(&original, level).map_err(ErrorKind::compression)?;
            if compressed.len() >= original.len() {
                return Ok(None);
            }
            let decoded = format.decompress(&compressed).map_err(ErrorKind::compression)?;
            let actual = FileHash::digest(&decoded);
            if actual != expected {
                exn::bail!(ErrorKind::IntegrityMismatch { expected, actual });
            }
            Ok(Some(compressed))
        })
        .await
        .or_raise(|| ErrorKind::Background)?;

        let compressed = match compressed {
            Ok(Some(compressed)) => compressed,
            Ok(None) => return Ok(Compaction::Skipped(SkipReason::NoGain)),
            Err(err) => {
                if matches!(&*err, ErrorKind::Corrupt(_)) {
                    tracing::warn!(path = %path.display(), "Cache entry does not match its hash; removing");
                    fs::remove_file(&path).await.map_err(|e| ErrorKind::io(e, &path))?;
                }
                return Err(err);
            },
        };

        let after = compressed.len() as u64;
        let target = self.cache.layout().entry(hash, self.format);
        let target = self.cache.persist_bytes(compressed, target).await?;
        if let Err(e) = fs::remove_file(&path).await {
            // Put things back the way they were.
            _ = fs::remove_file(&target).await;
            return Err(ErrorKind::io(e, &path).into());
        }
        tracing::debug!(before, after, "Compacted cache entry");
        Ok(Compaction::Compacted { before, after })
    }

    /// Compact an entry in the background. Failures are logged and otherwise
    /// ignored; the entry just stays uncompacted.
    pub fn schedule(&self, hash: FileHash) -> JoinHandle<()> {
        let compactor = self.clone();
        tokio::spawn(async move {
            match compactor.compact(&hash).await {
                Ok(Compaction::Compacted { .. }) => {},
                Ok(Compaction::Skipped(reason)) => tracing::trace!(%hash, ?reason, "Compaction skipped"),
                Err(e) => tracing::warn!(%hash, error = %e, "Compaction failed"),
            }
        })
    }

    /// Compact every uncompacted entry in the cache.
    ///
    /// A failure on one entry is reported as an `Err` item and doesn't stop
    /// the rest; only a failure to list the cache ends the stream early.
    pub fn compact_all(&self) -> impl Stream<Item = Result<CompactEvent>> + '_ {
        stream!({
            yield Ok(CompactEvent::Started);

            let pending: Vec<FileHash> = match self
                .cache
                .enumerate()
                .try_filter(|entry| std::future::ready(!entry.is_compacted()))
                .map_ok(|entry| entry.hash)
                .try_collect()
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };
            yield Ok(CompactEvent::DiscoveryComplete(pending.len() as u64));

            let mut queue = pending.into_iter();
            let mut processing = FuturesUnordered::new();
            for hash in queue.by_ref().take(MAX_CONCURRENT_COMPACTIONS) {
                processing.push(self.compact_one(hash));
            }
            while let Some((hash, result)) = processing.next().await {
                yield result.map(|compaction| CompactEvent::Processed(hash, compaction));
                if let Some(next) = queue.next() {
                    processing.push(self.compact_one(next));
                }
            }

            yield Ok(CompactEvent::Complete);
        })
    }

    async fn compact_one(&self, hash: FileHash) -> (FileHash, Result<Compaction>) {
        let result = self.compact(&hash).await;
        (hash, result)
    }
}
