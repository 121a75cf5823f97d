//! Content identity.
//!
//! Every asset is addressed by the BLAKE3 digest of its (logical, i.e.
//! uncompacted) bytes, written as 64 lowercase hex characters.

use crate::error::{ErrorKind, Result};
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Length of a digest in bytes.
pub const HASH_LEN: usize = blake3::OUT_LEN;
/// Length of a digest's hex representation.
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

/// Digest identifying a file by content.
///
/// Two files with equal hashes are byte-identical. The hash is computed once
/// and never changes, so it's `Copy` and cheap to pass around.
///
/// # Examples
///
/// ```
/// use mirage_storage::FileHash;
///
/// let hash = FileHash::digest(b"texture bytes");
/// let parsed: FileHash = hash.to_string().parse().unwrap();
/// assert_eq!(hash, parsed);
/// assert_eq!(hash.to_string().len(), 64);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHash([u8; HASH_LEN]);

impl FileHash {
    /// Hash a complete buffer.
    pub fn digest(bytes: impl AsRef<[u8]>) -> Self {
        blake3::hash(bytes.as_ref()).into()
    }

    /// Incremental hasher for data arriving in chunks.
    pub fn hasher() -> blake3::Hasher {
        blake3::Hasher::new()
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Name of the shard directory holding this hash (first byte, as hex).
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    /// Parse a hex digest, accepting either case.
    pub fn parse(hex: impl AsRef<str>) -> Result<Self> {
        let hex = hex.as_ref();
        match blake3::Hash::from_hex(hex) {
            Ok(hash) => Ok(hash.into()),
            Err(_) => exn::bail!(ErrorKind::InvalidHash(hex.to_string())),
        }
    }
}

impl From<blake3::Hash> for FileHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for FileHash {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for FileHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(blake3::Hash::from(self.0).to_hex().as_str())
    }
}

impl Debug for FileHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "FileHash({self})")
    }
}
