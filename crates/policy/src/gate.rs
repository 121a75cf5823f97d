//! Performance gate.
//!
//! Compares a peer's footprint (VRAM, triangles, height) against warn and
//! auto-pause thresholds. Each threshold can be switched off on its own.
//! Evaluation is a pure function of its inputs.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifies a peer in ignore and override lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);
impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    /// Paired with us individually rather than through a group.
    pub directly_paired: bool,
}
impl Peer {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self { id: id.into(), directly_paired: false }
    }

    pub fn directly_paired(mut self) -> Self {
        self.directly_paired = true;
        self
    }
}

/// Resource cost of a peer's synchronized appearance.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Footprint {
    pub vram_mib: u64,
    pub triangles: u64,
    pub height: f32,
    /// Height the multiplier applies to, e.g. the tallest default model.
    pub baseline_height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold<T> {
    pub enabled: bool,
    pub limit: T,
}
impl<T: PartialOrd> Threshold<T> {
    pub fn new(limit: T) -> Self {
        Self { enabled: true, limit }
    }

    pub fn disabled(limit: T) -> Self {
        Self { enabled: false, limit }
    }

    fn exceeded_by(&self, value: T) -> bool {
        self.enabled && value > self.limit
    }
}

/// Warn/pause pair for VRAM (MiB) or triangles (thousands).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionThresholds {
    pub warn: Threshold<u64>,
    pub pause: Threshold<u64>,
}
impl DimensionThresholds {
    /// Both limits enabled but pause below warn.
    pub fn is_inverted(&self) -> bool {
        self.warn.enabled && self.pause.enabled && self.pause.limit < self.warn.limit
    }

    fn assess(&self, value: u64) -> Option<Severity> {
        if self.pause.exceeded_by(value) {
            Some(Severity::Pause)
        } else if self.warn.exceeded_by(value) {
            Some(Severity::Warn)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightThresholds {
    /// Warn when height exceeds the baseline times this.
    pub warn_multiplier: Threshold<f32>,
    /// Pause when height exceeds this, regardless of baseline.
    pub pause_absolute: Threshold<f32>,
}
impl HeightThresholds {
    fn assess(&self, footprint: &Footprint, allow_pause: bool) -> Option<Severity> {
        if allow_pause && self.pause_absolute.exceeded_by(footprint.height) {
            return Some(Severity::Pause);
        }
        let warn = self.warn_multiplier;
        (warn.enabled && footprint.height > footprint.baseline_height * warn.limit).then_some(Severity::Warn)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub vram: DimensionThresholds,
    /// Limits in thousands of triangles.
    pub triangles: DimensionThresholds,
    pub height: HeightThresholds,
    /// Height never auto-pauses a directly paired peer.
    pub exempt_direct_pairs: bool,
    /// Peers that are never warned about or paused.
    pub ignored: BTreeSet<PeerId>,
    /// Peers that are always paused.
    pub overrides: BTreeSet<PeerId>,
    /// Peers whose height is not checked.
    pub height_ignored: BTreeSet<PeerId>,
}
impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            vram: DimensionThresholds { warn: Threshold::new(375), pause: Threshold::new(550) },
            triangles: DimensionThresholds { warn: Threshold::new(165), pause: Threshold::new(250) },
            height: HeightThresholds {
                warn_multiplier: Threshold::new(2.0),
                pause_absolute: Threshold::disabled(10.0),
            },
            exempt_direct_pairs: true,
            ignored: BTreeSet::new(),
            overrides: BTreeSet::new(),
            height_ignored: BTreeSet::new(),
        }
    }
}
impl PerformanceThresholds {
    /// Dimensions whose enabled pause limit sits below their warn limit.
    pub fn inverted(&self) -> Vec<Dimension> {
        let mut inverted = Vec::new();
        if self.vram.is_inverted() {
            inverted.push(Dimension::Vram);
        }
        if self.triangles.is_inverted() {
            inverted.push(Dimension::Triangles);
        }
        inverted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum Dimension {
    #[display("VRAM")]
    Vram,
    Triangles,
    Height,
    /// Listed in the override list.
    #[display("manual override")]
    Override,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Warn,
    Pause,
}

/// Outcome of [`evaluate`], naming the dimensions responsible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Warn(Vec<Dimension>),
    AutoPause(Vec<Dimension>),
}
impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Verdict::AutoPause(_))
    }

    pub fn dimensions(&self) -> &[Dimension] {
        match self {
            Verdict::Ok => &[],
            Verdict::Warn(dimensions) | Verdict::AutoPause(dimensions) => dimensions,
        }
    }
}

/// Evaluate a peer's footprint.
///
/// The ignore list wins over everything, including the override list.
/// Within the remaining dimensions, any exceeded pause limit pauses; failing
/// that, any exceeded warn limit warns.
pub fn evaluate(peer: &Peer, footprint: &Footprint, thresholds: &PerformanceThresholds) -> Verdict {
    if thresholds.ignored.contains(&peer.id) {
        return Verdict::Ok;
    }
    if thresholds.overrides.contains(&peer.id) {
        return Verdict::AutoPause(vec![Dimension::Override]);
    }

    let height = match thresholds.height_ignored.contains(&peer.id) {
        true => None,
        false => {
            let allow_pause = !(thresholds.exempt_direct_pairs && peer.directly_paired);
            thresholds.height.assess(footprint, allow_pause)
        },
    };
    let assessed = [
        (Dimension::Vram, thresholds.vram.assess(footprint.vram_mib)),
        (Dimension::Triangles, thresholds.triangles.assess(footprint.triangles.div_ceil(1000))),
        (Dimension::Height, height),
    ];

    let with = |severity: Severity| {
        assessed
            .iter()
            .filter(|(_, assessed)| *assessed == Some(severity))
            .map(|(dimension, _)| *dimension)
            .collect::<Vec<_>>()
    };
    let (pause, warn) = (with(Severity::Pause), with(Severity::Warn));
    if !pause.is_empty() {
        Verdict::AutoPause(pause)
    } else if !warn.is_empty() {
        Verdict::Warn(warn)
    } else {
        Verdict::Ok
    }
}
