//! On-disk layout of the cache root.
//!
//! ```text
//! <root>/
//!   .staging/            temporary files, never readable as entries
//!   .alternates/<hash>   alias records: source hash -> alternate hash
//!   af/<hash>            uncompacted entry
//!   af/<hash>.zst        compacted entry (suffix names the codec)
//! ```

use crate::FileHash;
use crate::hash::HASH_HEX_LEN;
use mirage_compress::Compression;
use std::path::{Path, PathBuf};

pub(crate) const STAGING_DIR: &str = ".staging";
pub(crate) const ALTERNATES_DIR: &str = ".alternates";

/// Every format an entry may be stored in, plain first.
pub(crate) const STORED_FORMATS: &[Compression] = &[
    Compression::None,
    Compression::Gzip,
    Compression::Zstd,
];

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn alternates(&self) -> PathBuf {
        self.root.join(ALTERNATES_DIR)
    }

    pub fn shard(&self, hash: &FileHash) -> PathBuf {
        self.root.join(hash.shard())
    }

    pub fn entry(&self, hash: &FileHash, format: Compression) -> PathBuf {
        self.shard(hash).join(format!("{hash}{}", format.extension()))
    }

    pub fn alias(&self, source: &FileHash) -> PathBuf {
        self.alternates().join(source.to_string())
    }

    /// Whether a directory directly under the root can hold entries.
    pub fn is_shard_name(name: &str) -> bool {
        name.len() == 2 && name.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Parse an entry file name back into its hash and storage format.
    ///
    /// Returns `None` for anything that isn't exactly `<hash>[.<codec>]`.
    pub fn parse_entry_name(name: &str) -> Option<(FileHash, Compression)> {
        let (stem, ext) = match name.split_once('.') {
            Some((stem, ext)) => (stem, Some(ext)),
            None => (name, None),
        };
        if stem.len() != HASH_HEX_LEN {
            return None;
        }
        let hash = FileHash::parse(stem).ok()?;
        let format = match ext {
            None => Compression::None,
            Some(ext) => match Compression::from_extension(ext) {
                // An unknown suffix is not ours.
                Compression::None => return None,
                format => format,
            },
        };
        Some((hash, format))
    }
}
