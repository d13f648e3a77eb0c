// SPDX-License-Identifier: GPL-2.0
//
// freqd: operator profiles and their on-disk store.
//
// A profile is an ordered set of per-selector policy entries. The store
// keeps one pretty-printed JSON document per profile in a directory; a
// save→load→save cycle preserves policy semantics exactly.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::selector::CoreSelector;

/// Desired scaling policy for the cores one selector names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorePolicy {
    pub selector: CoreSelector,
    pub min_khz: u32,
    pub max_khz: u32,
    pub governor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_pref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turbo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
}

/// Named, ordered set of policy entries. Selectors must not overlap; the
/// validator rejects profiles where they do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<CorePolicy>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Profile {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// The global turbo state this profile asks for, if any entry does.
    pub fn turbo_request(&self) -> Option<bool> {
        self.entries.iter().find_map(|e| e.turbo)
    }
}

/// Directory-backed profile persistence.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating profile directory {}", dir.display()))?;
        Ok(ProfileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        let safe_name = name.replace(['/', '\\', ' ', ':', '.'], "_");
        self.dir.join(format!("{safe_name}.json"))
    }

    pub fn load(&self, name: &str) -> Result<Profile> {
        let path = self.profile_path(name);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading profile {}", path.display()))?;
        let profile: Profile = serde_json::from_str(&content)
            .with_context(|| format!("parsing profile {}", path.display()))?;
        Ok(profile)
    }

    pub fn save(&self, profile: &Profile) -> Result<()> {
        let path = self.profile_path(&profile.name);
        let json = serde_json::to_string_pretty(profile)?;
        fs::write(&path, json)
            .with_context(|| format!("writing profile {}", path.display()))?;
        info!("profile `{}` saved ({} entries)", profile.name, profile.entries.len());
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.profile_path(name);
        fs::remove_file(&path)
            .with_context(|| format!("deleting profile {}", path.display()))
    }

    /// Names of every stored profile, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(&path) {
                if let Ok(profile) = serde_json::from_str::<Profile>(&content) {
                    names.push(profile.name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load every parsable profile, keyed by name.
    pub fn load_all(&self) -> Result<HashMap<String, Profile>> {
        let mut profiles = HashMap::new();
        for name in self.list()? {
            if let Ok(profile) = self.load(&name) {
                profiles.insert(name, profile);
            }
        }
        Ok(profiles)
    }
}
