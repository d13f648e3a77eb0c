// SPDX-License-Identifier: GPL-2.0
//
// freqd: daemon configuration.
//
// A small TOML file; every key has a default so a missing file or an
// empty file both yield a working daemon.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use freqd_core::WriteOrder;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/freqd/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Directory holding one JSON document per profile.
    pub profile_dir: PathBuf,
    /// Profile applied at daemon start and re-enforced on events.
    pub active_profile: Option<String>,
    /// Whether the governor or the frequency bounds are written first.
    pub write_order: WriteOrder,
    /// Apply the active profile when the daemon starts.
    pub apply_on_start: bool,
    /// Callers allowed on the bus besides root.
    pub allowed_uids: Vec<u32>,
    /// Quiet period after a hot-plug burst before re-enforcement, in ms.
    pub settle_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            profile_dir: PathBuf::from("/etc/freqd/profiles"),
            active_profile: None,
            write_order: WriteOrder::default(),
            apply_on_start: true,
            allowed_uids: Vec::new(),
            settle_ms: 500,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no config at {}, using defaults", path.display());
                return Ok(DaemonConfig::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = DaemonConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, DaemonConfig::default());
        assert!(cfg.apply_on_start);
        assert_eq!(cfg.settle_ms, 500);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "active_profile = \"desk\"\nwrite_order = \"bounds-first\"\n",
        )
        .unwrap();

        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.active_profile.as_deref(), Some("desk"));
        assert_eq!(cfg.write_order, WriteOrder::BoundsFirst);
        assert_eq!(cfg.profile_dir, PathBuf::from("/etc/freqd/profiles"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not_a_key = 1\n").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut cfg = DaemonConfig::default();
        cfg.active_profile = Some("travel".to_string());
        cfg.allowed_uids = vec![1000];
        let raw = toml::to_string(&cfg).unwrap();
        let back: DaemonConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back, cfg);
    }
}
