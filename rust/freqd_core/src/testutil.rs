// SPDX-License-Identifier: GPL-2.0
//
// freqd: in-memory scaling interface for unit tests, with write-failure
// injection and a write log.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{ApplyFailure, TopologyError};
use crate::sysfs::{LivePolicy, ScalingInterface};
use crate::topology::CoreCapability;

#[derive(Debug, Clone)]
struct FakeCore {
    online: bool,
    offlinable: bool,
    hw_min_khz: u32,
    hw_max_khz: u32,
    governors: BTreeSet<String>,
    governor: String,
    min_khz: u32,
    max_khz: u32,
    energy_prefs: BTreeSet<String>,
    energy_pref: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    cores: BTreeMap<u32, FakeCore>,
    turbo: Option<bool>,
    rejected: HashSet<(u32, &'static str)>,
    writes: Vec<String>,
}

/// Test double for `ScalingInterface`.
#[derive(Debug, Default)]
pub struct FakeScaling {
    state: Mutex<FakeState>,
}

impl FakeScaling {
    /// `count` online cores, all with the same hardware range, running the
    /// `powersave` governor at full range, turbo toggle present and on.
    pub fn with_identical_cores(count: u32, hw_min_khz: u32, hw_max_khz: u32) -> Self {
        let fake = FakeScaling::default();
        {
            let mut state = fake.state.lock().unwrap();
            state.turbo = Some(true);
            for id in 0..count {
                state.cores.insert(
                    id,
                    FakeCore {
                        online: true,
                        offlinable: true,
                        hw_min_khz,
                        hw_max_khz,
                        governors: ["performance", "powersave"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                        governor: "powersave".to_string(),
                        min_khz: hw_min_khz,
                        max_khz: hw_max_khz,
                        energy_prefs: BTreeSet::new(),
                        energy_pref: None,
                    },
                );
            }
        }
        fake
    }

    pub fn force_offline(&self, core: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.cores.get_mut(&core) {
            c.online = false;
        }
    }

    /// Simulate physical removal: the core disappears from enumeration.
    pub fn remove_core(&self, core: u32) {
        self.state.lock().unwrap().cores.remove(&core);
    }

    /// Make a core refuse offlining (no writable `online` attribute).
    pub fn pin_core(&self, core: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.cores.get_mut(&core) {
            c.offlinable = false;
        }
    }

    pub fn set_turbo_support(&self, turbo: Option<bool>) {
        self.state.lock().unwrap().turbo = turbo;
    }

    pub fn set_energy_prefs(&self, core: u32, prefs: &[&str], current: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.cores.get_mut(&core) {
            c.energy_prefs = prefs.iter().map(|s| s.to_string()).collect();
            c.energy_pref = Some(current.to_string());
        }
    }

    /// All writes to `attr` of `core` fail from now on.
    pub fn reject_writes(&self, core: u32, attr: &'static str) {
        self.state.lock().unwrap().rejected.insert((core, attr));
    }

    /// Chronological log of successful writes, e.g. `cpu0/scaling_governor=performance`.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes.len()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    fn record(
        &self,
        core: u32,
        attr: &'static str,
        value: &str,
        mutate: impl FnOnce(&mut FakeCore),
    ) -> Result<(), ApplyFailure> {
        let mut state = self.state.lock().unwrap();
        if state.rejected.contains(&(core, attr)) {
            return Err(ApplyFailure::WriteRejected {
                attr: attr.to_string(),
                value: value.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        match state.cores.get_mut(&core) {
            Some(c) if c.online => mutate(c),
            _ => return Err(ApplyFailure::CoreOffline),
        }
        state.writes.push(format!("cpu{core}/{attr}={value}"));
        Ok(())
    }
}

impl ScalingInterface for FakeScaling {
    fn present_cores(&self) -> Result<Vec<u32>, TopologyError> {
        Ok(self.state.lock().unwrap().cores.keys().copied().collect())
    }

    fn is_online(&self, core: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .cores
            .get(&core)
            .map(|c| c.online)
            .unwrap_or(false)
    }

    fn is_offlinable(&self, core: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .cores
            .get(&core)
            .map(|c| c.offlinable)
            .unwrap_or(false)
    }

    fn capability(&self, core: u32) -> Result<CoreCapability, TopologyError> {
        let state = self.state.lock().unwrap();
        let c = state.cores.get(&core).ok_or(TopologyError::Malformed {
            path: format!("cpu{core}"),
            value: "absent".to_string(),
        })?;
        if !c.online {
            return Ok(CoreCapability::offline(core, c.offlinable));
        }
        Ok(CoreCapability {
            core_id: core,
            online: true,
            offlinable: c.offlinable,
            min_freq_khz: c.hw_min_khz,
            max_freq_khz: c.hw_max_khz,
            available_governors: c.governors.clone(),
            current_governor: c.governor.clone(),
            current_min_khz: c.min_khz,
            current_max_khz: c.max_khz,
            available_energy_prefs: c.energy_prefs.clone(),
            current_energy_pref: c.energy_pref.clone(),
        })
    }

    fn live_policy(&self, core: u32) -> Result<LivePolicy, TopologyError> {
        let state = self.state.lock().unwrap();
        let c = state.cores.get(&core).ok_or(TopologyError::Malformed {
            path: format!("cpu{core}"),
            value: "absent".to_string(),
        })?;
        Ok(LivePolicy {
            online: c.online,
            governor: if c.online { c.governor.clone() } else { String::new() },
            min_khz: if c.online { c.min_khz } else { 0 },
            max_khz: if c.online { c.max_khz } else { 0 },
            energy_pref: if c.online { c.energy_pref.clone() } else { None },
        })
    }

    fn write_governor(&self, core: u32, governor: &str) -> Result<(), ApplyFailure> {
        {
            let state = self.state.lock().unwrap();
            if let Some(c) = state.cores.get(&core) {
                if c.online && !c.governors.contains(governor) {
                    return Err(ApplyFailure::WriteRejected {
                        attr: "scaling_governor".to_string(),
                        value: governor.to_string(),
                        reason: "unknown governor".to_string(),
                    });
                }
            }
        }
        let governor_owned = governor.to_string();
        self.record(core, "scaling_governor", governor, move |c| {
            c.governor = governor_owned;
        })
    }

    fn write_min_khz(&self, core: u32, khz: u32) -> Result<(), ApplyFailure> {
        self.record(core, "scaling_min_freq", &khz.to_string(), |c| {
            c.min_khz = khz;
        })
    }

    fn write_max_khz(&self, core: u32, khz: u32) -> Result<(), ApplyFailure> {
        self.record(core, "scaling_max_freq", &khz.to_string(), |c| {
            c.max_khz = khz;
        })
    }

    fn write_energy_pref(&self, core: u32, pref: &str) -> Result<(), ApplyFailure> {
        let pref_owned = pref.to_string();
        self.record(core, "energy_performance_preference", pref, move |c| {
            c.energy_pref = Some(pref_owned);
        })
    }

    fn set_online(&self, core: u32, online: bool) -> Result<(), ApplyFailure> {
        let mut state = self.state.lock().unwrap();
        if state.rejected.contains(&(core, "online")) {
            return Err(ApplyFailure::WriteRejected {
                attr: "online".to_string(),
                value: online.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let Some(c) = state.cores.get_mut(&core) else {
            return Err(ApplyFailure::CoreOffline);
        };
        if !c.offlinable {
            return Err(ApplyFailure::WriteRejected {
                attr: "online".to_string(),
                value: online.to_string(),
                reason: "attribute not writable".to_string(),
            });
        }
        c.online = online;
        state
            .writes
            .push(format!("cpu{core}/online={}", if online { 1 } else { 0 }));
        Ok(())
    }

    fn turbo_enabled(&self) -> Option<bool> {
        self.state.lock().unwrap().turbo
    }

    fn set_turbo(&self, enabled: bool) -> Result<(), ApplyFailure> {
        let mut state = self.state.lock().unwrap();
        if state.rejected.contains(&(u32::MAX, "turbo")) {
            return Err(ApplyFailure::WriteRejected {
                attr: "turbo".to_string(),
                value: enabled.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        match state.turbo {
            Some(_) => {
                state.turbo = Some(enabled);
                state.writes.push(format!("turbo={enabled}"));
                Ok(())
            }
            None => Err(ApplyFailure::WriteRejected {
                attr: "turbo".to_string(),
                value: enabled.to_string(),
                reason: "no turbo/boost toggle exposed".to_string(),
            }),
        }
    }
}

/// Marker used with `reject_writes` to fail the global turbo write.
pub const TURBO_CORE: u32 = u32::MAX;

/// Lay down a minimal cpufreq tree for one core under `root`.
pub fn write_fake_core(
    root: &Path,
    core: u32,
    min_khz: u32,
    max_khz: u32,
    governor: &str,
    offlinable: bool,
) {
    let dir = root.join(format!("cpu{core}/cpufreq"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("cpuinfo_min_freq"), format!("{min_khz}\n")).unwrap();
    fs::write(dir.join("cpuinfo_max_freq"), format!("{max_khz}\n")).unwrap();
    fs::write(dir.join("scaling_min_freq"), format!("{min_khz}\n")).unwrap();
    fs::write(dir.join("scaling_max_freq"), format!("{max_khz}\n")).unwrap();
    fs::write(dir.join("scaling_governor"), format!("{governor}\n")).unwrap();
    fs::write(
        dir.join("scaling_available_governors"),
        "performance powersave\n",
    )
    .unwrap();
    if offlinable {
        fs::write(root.join(format!("cpu{core}/online")), "1\n").unwrap();
    }
}
