//! Decisions the sync engine makes without touching disk or network.
//!
//! Both halves are pure functions over configuration snapshots: the
//! [`selector`] picks source or alternate for a hash, and the [`gate`]
//! decides whether a peer's footprint should suspend syncing.

pub mod gate;
pub mod selector;

pub use crate::gate::{Dimension, Footprint, Peer, PeerId, PerformanceThresholds, Verdict, evaluate};
pub use crate::selector::{CompressionPolicy, Decision, resolve};
