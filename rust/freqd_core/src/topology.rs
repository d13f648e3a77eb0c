// SPDX-License-Identifier: GPL-2.0
//
// freqd: per-core capability enumeration.

use std::collections::BTreeSet;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::sysfs::ScalingInterface;

/// Immutable snapshot of one core's scaling capabilities and current
/// state. Re-read on demand; never cached across a hot-plug boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreCapability {
    pub core_id: u32,
    pub online: bool,
    pub offlinable: bool,
    pub min_freq_khz: u32,
    pub max_freq_khz: u32,
    pub available_governors: BTreeSet<String>,
    pub current_governor: String,
    pub current_min_khz: u32,
    pub current_max_khz: u32,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub available_energy_prefs: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_energy_pref: Option<String>,
}

impl CoreCapability {
    /// A present-but-offline core. Its cpufreq directory does not exist,
    /// so limits and governors are unknowable until it comes back online.
    pub fn offline(core_id: u32, offlinable: bool) -> Self {
        CoreCapability {
            core_id,
            online: false,
            offlinable,
            min_freq_khz: 0,
            max_freq_khz: 0,
            available_governors: BTreeSet::new(),
            current_governor: String::new(),
            current_min_khz: 0,
            current_max_khz: 0,
            available_energy_prefs: BTreeSet::new(),
            current_energy_pref: None,
        }
    }
}

/// Everything validation and callers need to know about the machine at one
/// point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub cores: Vec<CoreCapability>,
    /// Machine-global turbo state; `None` when no toggle is exposed.
    pub turbo_enabled: Option<bool>,
}

impl TopologySnapshot {
    pub fn core(&self, core_id: u32) -> Option<&CoreCapability> {
        self.cores.iter().find(|c| c.core_id == core_id)
    }

    pub fn present_ids(&self) -> Vec<u32> {
        self.cores.iter().map(|c| c.core_id).collect()
    }
}

/// Enumerate all present cores, ascending by id, reflecting live kernel
/// state at call time.
pub fn enumerate(iface: &dyn ScalingInterface) -> Result<Vec<CoreCapability>, TopologyError> {
    let mut cores = Vec::new();
    for id in iface.present_cores()? {
        cores.push(iface.capability(id)?);
    }
    debug!(
        "enumerated {} cores ({} online)",
        cores.len(),
        cores.iter().filter(|c| c.online).count()
    );
    Ok(cores)
}

pub fn snapshot(iface: &dyn ScalingInterface) -> Result<TopologySnapshot, TopologyError> {
    Ok(TopologySnapshot {
        cores: enumerate(iface)?,
        turbo_enabled: iface.turbo_enabled(),
    })
}
