use crate::FileHash;
use mirage_compress::Compression;
use time::OffsetDateTime;

/// One stored file, as seen by listing and stat operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: FileHash,
    /// Bytes occupied on disk (after compaction, if any).
    pub size: u64,
    /// Codec the entry is currently stored with; `None` means uncompacted.
    pub compression: Compression,
    /// Last time the entry was published or rewritten.
    pub modified: OffsetDateTime,
}
impl CacheEntry {
    pub fn is_compacted(&self) -> bool {
        self.compression.is_compressed()
    }
}

/// What the cache holds locally for a requested (source) hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Located {
    /// The source-quality file itself.
    Source,
    /// Only a server-compressed alternate, stored under its own digest.
    Alternate(FileHash),
    Missing,
}
impl Located {
    pub fn is_present(&self) -> bool {
        !matches!(self, Located::Missing)
    }
}
