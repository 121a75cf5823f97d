//! In-memory encode/decode.
//!
//! Cache entries are small enough to hold in memory and are always hashed
//! as a whole, so there is no streaming interface.

use crate::error::{ErrorKind, Result};
use crate::{Compression, Level};
use exn::ResultExt;
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use tracing::instrument;

impl Level {
    fn gzip(self) -> GzLevel {
        match self {
            Level::Fastest => GzLevel::fast(),
            Level::Balanced => GzLevel::default(),
            Level::Best => GzLevel::best(),
        }
    }

    #[cfg(feature = "zstd")]
    fn zstd(self) -> i32 {
        match self {
            Level::Fastest => 1,
            Level::Balanced => zstd::DEFAULT_COMPRESSION_LEVEL,
            // Ultra levels (20+) need large windows for little gain on textures.
            Level::Best => 19,
        }
    }
}

impl Compression {
    /// Compress at the [balanced](Level::Balanced) level.
    ///
    /// ```
    /// use mirage_compress::Compression;
    ///
    /// let texture = vec![0u8; 4096];
    /// let stored = Compression::Gzip.compress(&texture).unwrap();
    /// assert!(stored.len() < texture.len());
    /// assert_eq!(Compression::Gzip.decompress(&stored).unwrap(), texture);
    /// ```
    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        self.compress_with(input, Level::default())
    }

    #[instrument(level = "trace", skip(input), fields(format = %self, ?level, input_size = input.len()))]
    pub fn compress_with(&self, input: &[u8], level: Level) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(input.to_vec()),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 2), level.gzip());
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)
            },
            #[cfg(feature = "zstd")]
            Compression::Zstd => zstd::bulk::compress(input, level.zstd()).or_raise(|| ErrorKind::Encoder),
        }
    }

    /// Decode data produced by [`compress_with`](Self::compress_with) at any
    /// level.
    #[instrument(level = "trace", skip(input), fields(format = %self, input_size = input.len()))]
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        match self {
            Compression::None => output.extend_from_slice(input),
            Compression::Gzip => {
                GzDecoder::new(input).read_to_end(&mut output).or_raise(|| ErrorKind::InvalidData)?;
            },
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                zstd::stream::copy_decode(input, &mut output).or_raise(|| ErrorKind::InvalidData)?;
            },
        }
        Ok(output)
    }
}
