//! Source-quality vs. alternate selection.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt::Display as FmtDisplay;

/// How eagerly to use server-compressed alternates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionPolicy {
    /// Never use alternates.
    #[display("always-source-quality")]
    AlwaysSourceQuality,
    /// Use alternates for files not already held at source quality.
    #[display("compressed-new-downloads")]
    CompressedNewDownloads,
    /// Always use alternates.
    #[default]
    #[display("always-compressed")]
    AlwaysCompressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Decision {
    FetchSource,
    FetchAlternate,
}

/// Decide what to fetch for `hash`.
///
/// `source_cached` is whether the source-quality file is already held
/// locally; re-fetching an alternate for it would save no VRAM.
pub fn resolve(hash: impl FmtDisplay, policy: CompressionPolicy, source_cached: bool) -> Decision {
    let decision = match (policy, source_cached) {
        (CompressionPolicy::AlwaysSourceQuality, _) => Decision::FetchSource,
        (CompressionPolicy::CompressedNewDownloads, true) => Decision::FetchSource,
        (CompressionPolicy::CompressedNewDownloads, false) => Decision::FetchAlternate,
        (CompressionPolicy::AlwaysCompressed, _) => Decision::FetchAlternate,
    };
    tracing::trace!(%hash, %policy, source_cached, %decision, "Resolved variant");
    decision
}
