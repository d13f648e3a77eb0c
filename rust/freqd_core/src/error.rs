// SPDX-License-Identifier: GPL-2.0
//
// freqd: error taxonomy shared between the engine and the IPC layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures while reading the kernel's scaling interface.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The cpufreq interface is not exposed at all. Fatal for the whole
    /// engine; callers must not retry.
    #[error("no cpufreq scaling interface under {root}")]
    TopologyUnavailable { root: String },

    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unparsable value {value:?} in {path}")]
    Malformed { path: String, value: String },
}

/// Which frequency bound a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Min,
    Max,
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bound::Min => write!(f, "min"),
            Bound::Max => write!(f, "max"),
        }
    }
}

/// One violation found while checking a profile against live topology.
///
/// Validation collects every violation in a profile instead of stopping at
/// the first, so these travel in a `Vec` and serialize over IPC.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("selector `{selector}` matches no present core")]
    UnknownCore { selector: String },

    #[error("cores {cores:?} are claimed by more than one policy entry")]
    OverlappingSelectors { cores: Vec<u32> },

    #[error("core {core}: governor `{governor}` is not available")]
    UnsupportedGovernor { core: u32, governor: String },

    #[error("selector `{selector}`: min {min_khz} kHz is above max {max_khz} kHz")]
    MinAboveMax {
        selector: String,
        min_khz: u32,
        max_khz: u32,
    },

    #[error(
        "core {core}: {bound} bound {value_khz} kHz is outside the hardware \
         range {hw_min_khz}-{hw_max_khz} kHz"
    )]
    FrequencyOutOfBounds {
        core: u32,
        bound: Bound,
        value_khz: u32,
        hw_min_khz: u32,
        hw_max_khz: u32,
    },

    #[error("core {core}: energy preference `{pref}` is not available")]
    UnsupportedEnergyPref { core: u32, pref: String },

    #[error("core {core} cannot be taken offline")]
    NotOfflinable { core: u32 },

    #[error("turbo control requested but the platform exposes none")]
    TurboUnsupported,

    #[error("policy entries disagree on the global turbo state")]
    ConflictingTurbo,
}

/// Why a single core could not be brought to its target during an apply.
///
/// `CoreOffline` is benign (the core is simply gone right now) and never
/// triggers a rollback; everything else does.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyFailure {
    #[error("core is offline")]
    CoreOffline,

    #[error("driver rejected `{value}` for {attr}: {reason}")]
    WriteRejected {
        attr: String,
        value: String,
        reason: String,
    },
}

impl ApplyFailure {
    pub fn is_offline(&self) -> bool {
        matches!(self, ApplyFailure::CoreOffline)
    }
}

/// Engine-level outcome of an apply request before any write happens.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("profile failed validation with {} error(s)", .0.len())]
    Invalid(Vec<ValidationError>),
}
