//! Short names used in configuration, logs and on-disk suffixes.

use crate::error::{Error, ErrorKind};
use crate::{Compression, Level};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

impl Compression {
    /// Suffix appended to a compacted entry's file name, with its dot.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            #[cfg(feature = "zstd")]
            Compression::Zstd => ".zst",
        }
    }

    /// Inverse of [`extension`](Self::extension), taking the suffix without
    /// its dot. Anything unrecognised is plain content.
    #[must_use]
    pub fn from_extension(suffix: &str) -> Self {
        match suffix {
            "gz" => Compression::Gzip,
            #[cfg(feature = "zstd")]
            "zst" => Compression::Zstd,
            _ => Compression::None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
        }
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        *self != Compression::None
    }
}

impl Level {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Fastest => "fastest",
            Level::Balanced => "balanced",
            Level::Best => "best",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            #[cfg(feature = "zstd")]
            "zstd" | "zst" => Ok(Compression::Zstd),
            #[cfg(not(feature = "zstd"))]
            "zstd" | "zst" => exn::bail!(ErrorKind::Disabled(name.to_string())),
            _ => exn::bail!(ErrorKind::Unknown(name.to_string())),
        }
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "fastest" | "fast" => Ok(Level::Fastest),
            "balanced" | "default" => Ok(Level::Balanced),
            "best" => Ok(Level::Best),
            _ => exn::bail!(ErrorKind::Unknown(name.to_string())),
        }
    }
}
