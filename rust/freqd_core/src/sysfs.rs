// SPDX-License-Identifier: GPL-2.0
//
// freqd: access to the kernel's per-core cpufreq interface.
//
// Everything the engine knows about live hardware state comes through the
// `ScalingInterface` trait. The production implementation reads and writes
// the sysfs tree under /sys/devices/system/cpu; tests point it at a
// scratch directory or swap in an in-memory fake.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{ApplyFailure, TopologyError};
use crate::selector::parse_core_list;
use crate::topology::CoreCapability;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/devices/system/cpu";

/// Live policy state of one core, as currently programmed into the driver.
/// Captured before an apply mutates a core so a failed batch can replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePolicy {
    pub online: bool,
    pub governor: String,
    pub min_khz: u32,
    pub max_khz: u32,
    pub energy_pref: Option<String>,
}

/// The single source of truth for live scaling state.
pub trait ScalingInterface: Send + Sync {
    /// Ids of all present cores, ascending. Present includes offline.
    fn present_cores(&self) -> Result<Vec<u32>, TopologyError>;

    fn is_online(&self, core: u32) -> bool;

    /// Whether this core may be taken offline at all (core 0 usually not).
    fn is_offlinable(&self, core: u32) -> bool;

    fn capability(&self, core: u32) -> Result<CoreCapability, TopologyError>;

    fn live_policy(&self, core: u32) -> Result<LivePolicy, TopologyError>;

    fn write_governor(&self, core: u32, governor: &str) -> Result<(), ApplyFailure>;
    fn write_min_khz(&self, core: u32, khz: u32) -> Result<(), ApplyFailure>;
    fn write_max_khz(&self, core: u32, khz: u32) -> Result<(), ApplyFailure>;
    fn write_energy_pref(&self, core: u32, pref: &str) -> Result<(), ApplyFailure>;
    fn set_online(&self, core: u32, online: bool) -> Result<(), ApplyFailure>;

    /// Current machine-global turbo state, `None` when the platform
    /// exposes no toggle.
    fn turbo_enabled(&self) -> Option<bool>;
    fn set_turbo(&self, enabled: bool) -> Result<(), ApplyFailure>;
}

/// sysfs-backed implementation.
#[derive(Debug, Clone)]
pub struct SysfsScaling {
    root: PathBuf,
}

impl SysfsScaling {
    /// Open the scaling interface, failing with `TopologyUnavailable` when
    /// the kernel exposes no cpufreq tree at all.
    pub fn probe() -> Result<Self, TopologyError> {
        Self::probe_at(DEFAULT_SYSFS_ROOT)
    }

    pub fn probe_at(root: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let iface = Self {
            root: root.as_ref().to_path_buf(),
        };

        let unavailable = || TopologyError::TopologyUnavailable {
            root: iface.root.display().to_string(),
        };

        let cores = iface.present_cores().map_err(|_| unavailable())?;
        if cores.is_empty() {
            return Err(unavailable());
        }
        // At least one core must expose a cpufreq policy directory,
        // otherwise the hardware/driver does no frequency scaling.
        if !cores
            .iter()
            .any(|c| iface.cpufreq_dir(*c).is_dir())
        {
            return Err(unavailable());
        }

        debug!("cpufreq interface at {}: {} cores", iface.root.display(), cores.len());
        Ok(iface)
    }

    fn cpu_dir(&self, core: u32) -> PathBuf {
        self.root.join(format!("cpu{core}"))
    }

    fn cpufreq_dir(&self, core: u32) -> PathBuf {
        self.cpu_dir(core).join("cpufreq")
    }

    fn read_trimmed(&self, path: &Path) -> Result<String, TopologyError> {
        fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|source| TopologyError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    fn read_khz(&self, path: &Path) -> Result<u32, TopologyError> {
        let raw = self.read_trimmed(path)?;
        raw.parse::<u32>().map_err(|_| TopologyError::Malformed {
            path: path.display().to_string(),
            value: raw,
        })
    }

    /// Optional attribute: absent file maps to None, other errors surface.
    fn read_optional(&self, path: &Path) -> Result<Option<String>, TopologyError> {
        match fs::read_to_string(path) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(TopologyError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn write_attr(&self, path: &Path, value: &str) -> Result<(), ApplyFailure> {
        fs::write(path, value).map_err(|e| ApplyFailure::WriteRejected {
            attr: path.display().to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
    }

    fn freq_attr(&self, core: u32, name: &str) -> PathBuf {
        self.cpufreq_dir(core).join(name)
    }
}

impl ScalingInterface for SysfsScaling {
    fn present_cores(&self) -> Result<Vec<u32>, TopologyError> {
        // The kernel publishes present cores as a cpu-list mask; fall back
        // to globbing cpuN directories on kernels without the mask file.
        let mask = self.root.join("present");
        let mut cores = match self.read_optional(&mask)? {
            Some(raw) => parse_core_list(&raw).map_err(|_| TopologyError::Malformed {
                path: mask.display().to_string(),
                value: raw,
            })?,
            None => {
                let pattern = format!("{}/cpu[0-9]*", self.root.display());
                let mut found = Vec::new();
                for entry in glob::glob(&pattern).into_iter().flatten().flatten() {
                    if let Some(name) = entry.file_name().and_then(|n| n.to_str()) {
                        if let Ok(id) = name.trim_start_matches("cpu").parse::<u32>() {
                            found.push(id);
                        }
                    }
                }
                found
            }
        };
        cores.sort_unstable();
        Ok(cores)
    }

    fn is_online(&self, core: u32) -> bool {
        // Cores without an `online` attribute (typically core 0) cannot be
        // offlined and are online whenever present.
        match fs::read_to_string(self.cpu_dir(core).join("online")) {
            Ok(s) => s.trim() == "1",
            Err(_) => self.cpu_dir(core).is_dir(),
        }
    }

    fn is_offlinable(&self, core: u32) -> bool {
        self.cpu_dir(core).join("online").is_file()
    }

    fn capability(&self, core: u32) -> Result<CoreCapability, TopologyError> {
        if !self.is_online(core) {
            // An offline core has no cpufreq directory; its limits are
            // unknowable until it comes back.
            return Ok(CoreCapability::offline(core, self.is_offlinable(core)));
        }

        let governors = self
            .read_trimmed(&self.freq_attr(core, "scaling_available_governors"))?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let energy_prefs = self
            .read_optional(&self.freq_attr(core, "energy_performance_available_preferences"))?
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(CoreCapability {
            core_id: core,
            online: true,
            offlinable: self.is_offlinable(core),
            min_freq_khz: self.read_khz(&self.freq_attr(core, "cpuinfo_min_freq"))?,
            max_freq_khz: self.read_khz(&self.freq_attr(core, "cpuinfo_max_freq"))?,
            available_governors: governors,
            current_governor: self.read_trimmed(&self.freq_attr(core, "scaling_governor"))?,
            current_min_khz: self.read_khz(&self.freq_attr(core, "scaling_min_freq"))?,
            current_max_khz: self.read_khz(&self.freq_attr(core, "scaling_max_freq"))?,
            available_energy_prefs: energy_prefs,
            current_energy_pref: self
                .read_optional(&self.freq_attr(core, "energy_performance_preference"))?,
        })
    }

    fn live_policy(&self, core: u32) -> Result<LivePolicy, TopologyError> {
        if !self.is_online(core) {
            return Ok(LivePolicy {
                online: false,
                governor: String::new(),
                min_khz: 0,
                max_khz: 0,
                energy_pref: None,
            });
        }
        Ok(LivePolicy {
            online: true,
            governor: self.read_trimmed(&self.freq_attr(core, "scaling_governor"))?,
            min_khz: self.read_khz(&self.freq_attr(core, "scaling_min_freq"))?,
            max_khz: self.read_khz(&self.freq_attr(core, "scaling_max_freq"))?,
            energy_pref: self
                .read_optional(&self.freq_attr(core, "energy_performance_preference"))?,
        })
    }

    fn write_governor(&self, core: u32, governor: &str) -> Result<(), ApplyFailure> {
        self.write_attr(&self.freq_attr(core, "scaling_governor"), governor)
    }

    fn write_min_khz(&self, core: u32, khz: u32) -> Result<(), ApplyFailure> {
        self.write_attr(&self.freq_attr(core, "scaling_min_freq"), &khz.to_string())
    }

    fn write_max_khz(&self, core: u32, khz: u32) -> Result<(), ApplyFailure> {
        self.write_attr(&self.freq_attr(core, "scaling_max_freq"), &khz.to_string())
    }

    fn write_energy_pref(&self, core: u32, pref: &str) -> Result<(), ApplyFailure> {
        self.write_attr(&self.freq_attr(core, "energy_performance_preference"), pref)
    }

    fn set_online(&self, core: u32, online: bool) -> Result<(), ApplyFailure> {
        let path = self.cpu_dir(core).join("online");
        self.write_attr(&path, if online { "1" } else { "0" })
    }

    fn turbo_enabled(&self) -> Option<bool> {
        // intel_pstate inverts the sense; the generic boost knob does not.
        if let Ok(v) = fs::read_to_string(self.root.join("intel_pstate/no_turbo")) {
            return Some(v.trim() == "0");
        }
        if let Ok(v) = fs::read_to_string(self.root.join("cpufreq/boost")) {
            return Some(v.trim() == "1");
        }
        None
    }

    fn set_turbo(&self, enabled: bool) -> Result<(), ApplyFailure> {
        let no_turbo = self.root.join("intel_pstate/no_turbo");
        if no_turbo.is_file() {
            return self.write_attr(&no_turbo, if enabled { "0" } else { "1" });
        }
        let boost = self.root.join("cpufreq/boost");
        if boost.is_file() {
            return self.write_attr(&boost, if enabled { "1" } else { "0" });
        }
        Err(ApplyFailure::WriteRejected {
            attr: "turbo".to_string(),
            value: enabled.to_string(),
            reason: "no turbo/boost toggle exposed".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_fake_core;
    use tempfile::tempdir;

    #[test]
    fn probe_fails_without_cpufreq_tree() {
        let dir = tempdir().unwrap();
        match SysfsScaling::probe_at(dir.path()) {
            Err(TopologyError::TopologyUnavailable { .. }) => {}
            other => panic!("expected TopologyUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn probe_fails_when_cores_lack_cpufreq() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("present"), "0-1\n").unwrap();
        fs::create_dir_all(dir.path().join("cpu0")).unwrap();
        fs::create_dir_all(dir.path().join("cpu1")).unwrap();
        assert!(matches!(
            SysfsScaling::probe_at(dir.path()),
            Err(TopologyError::TopologyUnavailable { .. })
        ));
    }

    #[test]
    fn reads_capability_from_fake_tree() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("present"), "0-1\n").unwrap();
        write_fake_core(dir.path(), 0, 800_000, 3_500_000, "powersave", true);
        write_fake_core(dir.path(), 1, 800_000, 3_500_000, "powersave", true);

        let iface = SysfsScaling::probe_at(dir.path()).unwrap();
        assert_eq!(iface.present_cores().unwrap(), vec![0, 1]);

        let cap = iface.capability(1).unwrap();
        assert!(cap.online);
        assert_eq!(cap.min_freq_khz, 800_000);
        assert_eq!(cap.max_freq_khz, 3_500_000);
        assert!(cap.available_governors.contains("performance"));
        assert_eq!(cap.current_governor, "powersave");
        assert!(cap.offlinable);
    }

    #[test]
    fn core_without_online_attr_is_online_and_pinned() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("present"), "0\n").unwrap();
        write_fake_core(dir.path(), 0, 800_000, 3_500_000, "powersave", false);

        let iface = SysfsScaling::probe_at(dir.path()).unwrap();
        assert!(iface.is_online(0));
        assert!(!iface.is_offlinable(0));
    }

    #[test]
    fn offline_core_reports_empty_capability() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("present"), "0-1\n").unwrap();
        write_fake_core(dir.path(), 0, 800_000, 3_500_000, "powersave", false);
        fs::create_dir_all(dir.path().join("cpu1")).unwrap();
        fs::write(dir.path().join("cpu1/online"), "0\n").unwrap();

        let iface = SysfsScaling::probe_at(dir.path()).unwrap();
        let cap = iface.capability(1).unwrap();
        assert!(!cap.online);
        assert!(cap.available_governors.is_empty());
        assert_eq!(cap.max_freq_khz, 0);
    }

    #[test]
    fn writes_land_in_the_tree() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("present"), "0\n").unwrap();
        write_fake_core(dir.path(), 0, 800_000, 3_500_000, "powersave", false);

        let iface = SysfsScaling::probe_at(dir.path()).unwrap();
        iface.write_governor(0, "performance").unwrap();
        iface.write_min_khz(0, 1_200_000).unwrap();

        let live = iface.live_policy(0).unwrap();
        assert_eq!(live.governor, "performance");
        assert_eq!(live.min_khz, 1_200_000);
    }
}
