// SPDX-License-Identifier: GPL-2.0
//
// freqd: profile validation against live topology.
//
// Pure function, no side effects. Collects every violation instead of
// stopping at the first so a caller can report all problems in one pass.

use std::collections::BTreeMap;

use crate::error::{Bound, ValidationError};
use crate::profile::Profile;
use crate::topology::TopologySnapshot;

/// Check a candidate profile against a topology snapshot.
///
/// A profile with zero entries is valid (a no-op apply). Checks needing a
/// core's capability set are skipped for offline cores, whose capabilities
/// are unknowable; the enforcement engine handles those at apply time.
pub fn validate(profile: &Profile, topo: &TopologySnapshot) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let present = topo.present_ids();

    // core id -> number of entries claiming it
    let mut claims: BTreeMap<u32, usize> = BTreeMap::new();

    for entry in &profile.entries {
        let resolved = entry.selector.resolve(&present);
        if resolved.is_empty() {
            errors.push(ValidationError::UnknownCore {
                selector: entry.selector.to_string(),
            });
            continue;
        }
        for core in &resolved {
            *claims.entry(*core).or_default() += 1;
        }

        if entry.min_khz > entry.max_khz {
            errors.push(ValidationError::MinAboveMax {
                selector: entry.selector.to_string(),
                min_khz: entry.min_khz,
                max_khz: entry.max_khz,
            });
        }

        for core in resolved {
            let cap = match topo.core(core) {
                Some(cap) if cap.online => cap,
                // Offline cores expose no capabilities to check against;
                // the enforcement engine deals with them at apply time.
                _ => continue,
            };

            if !cap.available_governors.contains(&entry.governor) {
                errors.push(ValidationError::UnsupportedGovernor {
                    core,
                    governor: entry.governor.clone(),
                });
            }

            for (bound, value) in [(Bound::Min, entry.min_khz), (Bound::Max, entry.max_khz)] {
                if value < cap.min_freq_khz || value > cap.max_freq_khz {
                    errors.push(ValidationError::FrequencyOutOfBounds {
                        core,
                        bound,
                        value_khz: value,
                        hw_min_khz: cap.min_freq_khz,
                        hw_max_khz: cap.max_freq_khz,
                    });
                }
            }

            if let Some(pref) = &entry.energy_pref {
                if !cap.available_energy_prefs.contains(pref) {
                    errors.push(ValidationError::UnsupportedEnergyPref {
                        core,
                        pref: pref.clone(),
                    });
                }
            }

            if entry.online == Some(false) && !cap.offlinable {
                errors.push(ValidationError::NotOfflinable { core });
            }
        }
    }

    let overlapping: Vec<u32> = claims
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(core, _)| *core)
        .collect();
    if !overlapping.is_empty() {
        errors.push(ValidationError::OverlappingSelectors { cores: overlapping });
    }

    let turbo_requests: Vec<bool> = profile.entries.iter().filter_map(|e| e.turbo).collect();
    if !turbo_requests.is_empty() {
        if turbo_requests.iter().any(|t| *t != turbo_requests[0]) {
            errors.push(ValidationError::ConflictingTurbo);
        }
        if topo.turbo_enabled.is_none() {
            errors.push(ValidationError::TurboUnsupported);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
