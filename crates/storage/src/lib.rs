//! Local content-addressed storage for appearance assets.
//!
//! Assets are stored under the BLAKE3 digest of their bytes. The
//! [`ContentCache`] publishes entries atomically, verifies them on every
//! read, and serializes writers of the same hash. The [`Compactor`] rewrites
//! entries in compressed form in the background without changing what
//! readers get back.

mod cache;
pub mod compact;
mod entry;
pub mod error;
mod hash;
mod layout;
pub mod maintenance;

pub use crate::cache::{Claim, ContentCache, Recovery, StagedWrite, WriteClaim};
pub use crate::compact::{CompactEvent, Compaction, Compactor, SkipReason};
pub use crate::entry::{CacheEntry, Located};
pub use crate::hash::{FileHash, HASH_HEX_LEN, HASH_LEN};
pub use crate::maintenance::{Eviction, Verification};
