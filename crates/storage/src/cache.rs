//! Content-addressed cache of retrieved assets.
//!
//! Writes are staged in `.staging` and published with an atomic rename, so an
//! entry is either fully present or absent; readers never see a half-written
//! file, even after a crash. Each hash has its own async lock: at most one
//! writer per hash, and readers of that hash (and only that hash) wait behind
//! an in-flight writer.

use crate::FileHash;
use crate::entry::{CacheEntry, Located};
use crate::error::{ErrorKind, Result};
use crate::layout::{Layout, STORED_FORMATS};
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, TryStreamExt};
use mirage_compress::Compression;
use std::collections::HashMap;
use std::fs::Metadata;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::instrument;

type HashLock = Arc<RwLock<()>>;

/// What [`ContentCache::open`] cleaned up after an unclean shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    /// Temporary files from writes that never committed.
    pub staging_removed: usize,
    /// Extra copies of an entry left by an interrupted compaction.
    pub duplicates_removed: usize,
}
impl Recovery {
    pub fn is_clean(&self) -> bool {
        self.staging_removed == 0 && self.duplicates_removed == 0
    }
}

/// Result of [`ContentCache::claim`].
pub enum Claim<'a> {
    /// Someone already stored this hash; nothing to do.
    Present(CacheEntry),
    /// Caller is now the only writer for this hash until the claim is
    /// committed or dropped.
    Vacant(WriteClaim<'a>),
}

/// Local, content-addressed store keyed by [`FileHash`].
///
/// # Examples
///
/// ```no_run
/// use mirage_storage::{ContentCache, FileHash};
///
/// # async fn example() -> mirage_storage::error::Result<()> {
/// let cache = ContentCache::open("/var/cache/mirage").await?;
/// let bytes = b"texture".to_vec();
/// let hash = FileHash::digest(&bytes);
/// cache.write(&hash, &bytes).await?;
/// assert_eq!(cache.read(&hash).await?, bytes);
/// # Ok(())
/// # }
/// ```
pub struct ContentCache {
    layout: Layout,
    locks: Mutex<HashMap<FileHash, HashLock>>,
}

impl ContentCache {
    /// Open (creating if needed) the cache rooted at an absolute path, then
    /// clean up whatever an earlier crash left behind.
    ///
    /// The cache assumes it is the only process using `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidRoot(root));
        }
        match fs::metadata(&root).await {
            Ok(metadata) if !metadata.is_dir() => exn::bail!(ErrorKind::InvalidRoot(root)),
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(ErrorKind::io(e, &root).into()),
        }
        let layout = Layout::new(root);
        for dir in [layout.root().to_path_buf(), layout.staging(), layout.alternates()] {
            fs::create_dir_all(&dir).await.map_err(|e| ErrorKind::io(e, &dir))?;
        }

        let cache = Self { layout, locks: Mutex::default() };
        let recovery = cache.recover().await?;
        if !recovery.is_clean() {
            tracing::info!(
                root = %cache.root().display(),
                staging_removed = recovery.staging_removed,
                duplicates_removed = recovery.duplicates_removed,
                "Recovered cache after unclean shutdown"
            );
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Lock guarding a single hash. Locks nobody holds or waits on are pruned
    /// here; every new holder goes through this map, so that's race-free.
    fn lock_for(&self, hash: &FileHash) -> HashLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(*hash).or_default())
    }

    pub(crate) async fn lock_exclusive(&self, hash: &FileHash) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(hash).write_owned().await
    }

    /// Locate the stored file for a hash, in whichever format it currently is.
    pub(crate) async fn find(&self, hash: &FileHash) -> Result<Option<(PathBuf, Compression, Metadata)>> {
        for format in STORED_FORMATS {
            let path = self.layout.entry(hash, *format);
            match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => return Ok(Some((path, *format, metadata))),
                Ok(_) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(ErrorKind::io(e, &path).into()),
            }
        }
        Ok(None)
    }

    pub(crate) fn entry(hash: FileHash, compression: Compression, metadata: &Metadata) -> Result<CacheEntry> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(CacheEntry { hash, size: metadata.len(), compression, modified })
    }

    /// Check whether an entry exists, without waiting for in-flight writers.
    pub async fn exists(&self, hash: &FileHash) -> Result<bool> {
        Ok(self.find(hash).await?.is_some())
    }

    /// Whether the source-quality file for `hash` is held locally (as opposed
    /// to nothing, or only an alternate).
    pub async fn has_source(&self, hash: &FileHash) -> Result<bool> {
        self.exists(hash).await
    }

    /// Metadata for a stored entry.
    ///
    /// Returns [`NotFound`](ErrorKind::NotFound) if the hash isn't cached.
    pub async fn stat(&self, hash: &FileHash) -> Result<CacheEntry> {
        match self.find(hash).await? {
            Some((_, format, metadata)) => Self::entry(*hash, format, &metadata),
            None => exn::bail!(ErrorKind::NotFound(*hash)),
        }
    }

    /// Read the logical bytes of an entry, undoing any compaction.
    ///
    /// The digest is checked on every read. An entry that fails the check is
    /// deleted and reported as [`Corrupt`](ErrorKind::Corrupt).
    #[instrument(skip(self), fields(%hash))]
    pub async fn read(&self, hash: &FileHash) -> Result<Vec<u8>> {
        let lock = self.lock_for(hash);
        let guard = lock.read().await;
        let (path, format, _) = self.find(hash).await?.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(*hash)))?;
        let stored = fs::read(&path).await.map_err(|e| ErrorKind::io(e, &path))?;
        let expected = *hash;
        let logical = tokio::task::spawn_blocking(move || {
            let bytes = match format {
                Compression::None => stored,
                format => format.decompress(&stored).ok()?,
            };
            (FileHash::digest(&bytes) == expected).then_some(bytes)
        })
        .await
        .or_raise(|| ErrorKind::Background)?;
        drop(guard);

        match logical {
            Some(bytes) => Ok(bytes),
            None => {
                tracing::warn!(path = %path.display(), "Cache entry does not match its hash; removing");
                let _guard = lock.write().await;
                // Gone already is fine; someone else cleaned it up.
                if let Err(e) = fs::remove_file(&path).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    return Err(ErrorKind::io(e, &path).into());
                }
                exn::bail!(ErrorKind::Corrupt(*hash))
            },
        }
    }

    /// Become the single writer for `hash`, or learn that it's already stored.
    ///
    /// If another writer holds the hash, this waits for it to finish first.
    /// When that writer committed, the result is [`Claim::Present`]; if it
    /// gave up, this caller gets the [`Claim::Vacant`] slot instead.
    pub async fn claim(&self, hash: &FileHash) -> Result<Claim<'_>> {
        let guard = self.lock_exclusive(hash).await;
        if let Some((_, format, metadata)) = self.find(hash).await? {
            return Ok(Claim::Present(Self::entry(*hash, format, &metadata)?));
        }
        Ok(Claim::Vacant(WriteClaim { cache: self, hash: *hash, _guard: guard }))
    }

    /// Store a complete buffer under its hash.
    ///
    /// The digest of `bytes` is checked first; on mismatch nothing is
    /// written and [`IntegrityMismatch`](ErrorKind::IntegrityMismatch) is
    /// returned. Writing something already stored succeeds without I/O.
    #[instrument(skip(self, bytes), fields(%hash, size = bytes.len()))]
    pub async fn write(&self, hash: &FileHash, bytes: &[u8]) -> Result<CacheEntry> {
        let actual = FileHash::digest(bytes);
        if actual != *hash {
            exn::bail!(ErrorKind::IntegrityMismatch { expected: *hash, actual });
        }
        match self.claim(hash).await? {
            Claim::Present(entry) => Ok(entry),
            Claim::Vacant(claim) => claim.commit(bytes).await,
        }
    }

    /// Delete an entry in every format it's stored in.
    ///
    /// Returns [`NotFound`](ErrorKind::NotFound) if nothing was stored.
    #[instrument(skip(self), fields(%hash))]
    pub async fn remove(&self, hash: &FileHash) -> Result<()> {
        let _guard = self.lock_exclusive(hash).await;
        let mut removed = false;
        for format in STORED_FORMATS {
            let path = self.layout.entry(hash, *format);
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(ErrorKind::io(e, &path).into()),
            }
        }
        if !removed {
            exn::bail!(ErrorKind::NotFound(*hash));
        }
        Ok(())
    }

    /// Record that `source` is satisfied locally by the alternate stored as
    /// `alternate`.
    pub async fn link_alternate(&self, source: &FileHash, alternate: &FileHash) -> Result<()> {
        let target = self.layout.alias(source);
        self.persist_bytes(alternate.to_string().into_bytes(), target).await?;
        Ok(())
    }

    /// Find what is held locally for a requested source hash.
    pub async fn locate(&self, source: &FileHash) -> Result<Located> {
        if self.exists(source).await? {
            return Ok(Located::Source);
        }
        let alias = self.layout.alias(source);
        let record = match fs::read_to_string(&alias).await {
            Ok(record) => record,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Located::Missing),
            Err(e) => return Err(ErrorKind::io(e, &alias).into()),
        };
        let Ok(alternate) = FileHash::parse(record.trim()) else {
            tracing::warn!(path = %alias.display(), "Discarding unreadable alternate record");
            _ = fs::remove_file(&alias).await;
            return Ok(Located::Missing);
        };
        if self.exists(&alternate).await? {
            return Ok(Located::Alternate(alternate));
        }
        tracing::debug!(%source, %alternate, "Removing alternate record for an evicted entry");
        // A download may have relinked the source meanwhile.
        if fs::read_to_string(&alias).await.is_ok_and(|current| current == record) {
            _ = fs::remove_file(&alias).await;
        }
        Ok(Located::Missing)
    }

    /// Write `bytes` to a staging file and atomically move it to `target`.
    ///
    /// Callers must hold whatever lock protects `target`.
    pub(crate) async fn persist_bytes(&self, bytes: Vec<u8>, target: PathBuf) -> Result<PathBuf> {
        let staging = self.layout.staging();
        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ErrorKind::io(e, parent))?;
            }
            let mut file = NamedTempFile::new_in(&staging).map_err(|e| ErrorKind::io(e, &staging))?;
            file.write_all(&bytes).map_err(|e| ErrorKind::io(e, &staging))?;
            file.as_file().sync_all().map_err(|e| ErrorKind::io(e, &staging))?;
            file.persist(&target).map_err(|e| ErrorKind::io(e.error, &target))?;
            Ok(target)
        })
        .await
        .or_raise(|| ErrorKind::Background)?
    }

    /// Stream every entry in the cache.
    ///
    /// The listing is lazy and finite; each call walks the directory tree
    /// afresh. Files that aren't entries (foreign names, staging files, alias
    /// records) are never yielded.
    pub fn enumerate(&self) -> impl Stream<Item = Result<CacheEntry>> + '_ {
        let root = self.layout.root();
        stream!({
            let mut shards = match fs::read_dir(root).await {
                Ok(shards) => shards,
                Err(e) => {
                    yield Err(exn::Exn::from(ErrorKind::io(e, root)));
                    return;
                },
            };
            'shards: loop {
                let shard = match shards.next_entry().await {
                    Ok(Some(shard)) => shard,
                    Ok(None) => break 'shards,
                    Err(e) => {
                        yield Err(exn::Exn::from(ErrorKind::io(e, root)));
                        break 'shards;
                    },
                };
                if !shard.file_name().to_str().is_some_and(Layout::is_shard_name) {
                    continue 'shards;
                }
                let shard_path = shard.path();
                let mut files = match fs::read_dir(&shard_path).await {
                    Ok(files) => files,
                    // Not a directory, or removed since the root was listed.
                    Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory) => {
                        continue 'shards;
                    },
                    Err(e) => {
                        yield Err(exn::Exn::from(ErrorKind::io(e, &shard_path)));
                        continue 'shards;
                    },
                };
                'files: loop {
                    let file = match files.next_entry().await {
                        Ok(Some(file)) => file,
                        Ok(None) => break 'files,
                        Err(e) => {
                            yield Err(exn::Exn::from(ErrorKind::io(e, &shard_path)));
                            break 'files;
                        },
                    };
                    match Self::process_entry(file).await {
                        Ok(Some(entry)) => yield Ok(entry),
                        Ok(None) => {},
                        Err(e) => yield Err(e),
                    }
                }
            }
        })
    }

    async fn process_entry(file: DirEntry) -> Result<Option<CacheEntry>> {
        let Some((hash, format)) = file.file_name().to_str().and_then(Layout::parse_entry_name) else {
            return Ok(None);
        };
        let path = file.path();
        let metadata = match file.metadata().await {
            Ok(metadata) => metadata,
            // Evicted while we were listing.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ErrorKind::io(e, &path).into()),
        };
        if !metadata.is_file() {
            return Ok(None);
        }
        Self::entry(hash, format, &metadata).map(Some)
    }

    /// Remove leftovers of writes and compactions interrupted by a crash.
    pub async fn recover(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();

        let staging = self.layout.staging();
        let mut leftovers = fs::read_dir(&staging).await.map_err(|e| ErrorKind::io(e, &staging))?;
        while let Some(leftover) = leftovers.next_entry().await.map_err(|e| ErrorKind::io(e, &staging))? {
            let path = leftover.path();
            match fs::remove_file(&path).await {
                Ok(()) => recovery.staging_removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove staging file"),
            }
        }

        let mut copies: HashMap<FileHash, Vec<Compression>> = HashMap::new();
        let mut entries = pin!(self.enumerate());
        while let Some(entry) = entries.try_next().await? {
            copies.entry(entry.hash).or_default().push(entry.compression);
        }
        for (hash, mut formats) in copies.into_iter().filter(|(_, formats)| formats.len() > 1) {
            // Compaction publishes the compacted copy before removing the
            // plain one, so when both exist the plain file is the original.
            formats.sort_by_key(|format| format.is_compressed());
            for format in formats.into_iter().skip(1) {
                let path = self.layout.entry(&hash, format);
                fs::remove_file(&path).await.map_err(|e| ErrorKind::io(e, &path))?;
                recovery.duplicates_removed += 1;
            }
        }
        Ok(recovery)
    }
}

/// Exclusive right to store one hash. See [`ContentCache::claim`].
pub struct WriteClaim<'a> {
    cache: &'a ContentCache,
    hash: FileHash,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl<'a> WriteClaim<'a> {
    pub fn hash(&self) -> &FileHash {
        &self.hash
    }

    /// Open a staging file to receive the entry's bytes incrementally.
    pub fn stage(self) -> Result<StagedWrite<'a>> {
        let staging = self.cache.layout.staging();
        let prefix = format!("{}.", self.hash);
        let named =
            tempfile::Builder::new().prefix(&prefix).tempfile_in(&staging).map_err(|e| ErrorKind::io(e, &staging))?;
        let (file, path) = named.into_parts();
        Ok(StagedWrite {
            claim: self,
            file: fs::File::from_std(file),
            path,
            hasher: FileHash::hasher(),
            written: 0,
        })
    }

    /// Store a complete buffer.
    pub async fn commit(self, bytes: &[u8]) -> Result<CacheEntry> {
        let mut staged = self.stage()?;
        staged.write(bytes).await?;
        staged.commit().await
    }
}

/// An entry being written. Nothing is visible to readers until [`commit`]
/// succeeds; dropping it at any point deletes the staging file.
///
/// [`commit`]: StagedWrite::commit
pub struct StagedWrite<'a> {
    claim: WriteClaim<'a>,
    file: fs::File,
    path: TempPath,
    hasher: blake3::Hasher,
    written: u64,
}

impl StagedWrite<'_> {
    pub fn hash(&self) -> &FileHash {
        &self.claim.hash
    }

    /// Bytes staged so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);
        self.file.write_all(chunk).await.map_err(|e| ErrorKind::io(e, &self.path))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Verify the staged bytes against the claimed hash and publish them.
    ///
    /// On [`IntegrityMismatch`](ErrorKind::IntegrityMismatch) the staging file
    /// is discarded and the hash stays absent.
    pub async fn commit(self) -> Result<CacheEntry> {
        let Self { claim, mut file, path, hasher, written } = self;
        file.flush().await.map_err(|e| ErrorKind::io(e, &path))?;
        file.sync_all().await.map_err(|e| ErrorKind::io(e, &path))?;
        drop(file);

        let expected = claim.hash;
        let actual = FileHash::from(hasher.finalize());
        if actual != expected {
            tracing::debug!(%expected, %actual, written, "Discarding staged write");
            exn::bail!(ErrorKind::IntegrityMismatch { expected, actual });
        }

        let layout = claim.cache.layout();
        let shard = layout.shard(&expected);
        fs::create_dir_all(&shard).await.map_err(|e| ErrorKind::io(e, &shard))?;
        let target = layout.entry(&expected, Compression::None);
        path.persist(&target).map_err(|e| ErrorKind::io(e.error, &target))?;
        let metadata = fs::metadata(&target).await.map_err(|e| ErrorKind::io(e, &target))?;
        tracing::debug!(hash = %expected, size = written, "Published cache entry");
        ContentCache::entry(expected, Compression::None, &metadata)
    }
}
