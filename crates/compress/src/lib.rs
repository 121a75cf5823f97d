//! Codecs the cache compactor stores entries with.
//!
//! Gzip is always built; zstd sits behind the default `zstd` feature.
//! Compaction runs while the client is in use, so [`Level::Balanced`] is the
//! default and [`Level::Best`] is meant for offline maintenance.

pub mod error;
mod names;
mod ops;
#[cfg(feature = "serde")]
mod serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Stored as received.
    #[default]
    None,
    Gzip,
    #[cfg(feature = "zstd")]
    Zstd,
}

/// Encoder effort. Decoding ignores it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Level {
    Fastest,
    #[default]
    Balanced,
    Best,
}
