// SPDX-License-Identifier: GPL-2.0
//
// freqd: the policy engine owning all live-state mutation.
//
// One instance exists per daemon. Applies are mutually exclusive: the
// apply lock is held across validate, write, and any rollback, so readers
// never observe a state mid-rollback. Reads take no lock beyond the
// current-profile RwLock and may run concurrently with a pending apply.

use std::sync::{Arc, RwLock};

use log::{info, warn};

use crate::enforce::{self, EnforcementResult, WriteOrder};
use crate::error::EngineError;
use crate::profile::Profile;
use crate::sysfs::ScalingInterface;
use crate::topology::{self, TopologySnapshot};
use crate::validate::validate;

pub struct PolicyEngine {
    iface: Arc<dyn ScalingInterface>,
    write_order: WriteOrder,
    /// Serializes apply invocations (writers) against snapshot readers.
    /// Readers share the lock, so snapshots run concurrently with each
    /// other but never observe a state mid-apply or mid-rollback.
    state_lock: RwLock<()>,
    /// Last successfully applied profile; the recovery target for
    /// re-enforcement after hot-plug and resume.
    current: RwLock<Option<Profile>>,
}

impl PolicyEngine {
    pub fn new(iface: Arc<dyn ScalingInterface>, write_order: WriteOrder) -> Self {
        PolicyEngine {
            iface,
            write_order,
            state_lock: RwLock::new(()),
            current: RwLock::new(None),
        }
    }

    /// Live topology, read fresh from the kernel. Concurrent with other
    /// readers; waits out an executing apply so it never sees a
    /// half-written batch.
    pub fn snapshot(&self) -> Result<TopologySnapshot, EngineError> {
        let _guard = self.state_lock.read().unwrap_or_else(|e| e.into_inner());
        Ok(topology::snapshot(self.iface.as_ref())?)
    }

    pub fn current_profile(&self) -> Option<Profile> {
        self.read_current().clone()
    }

    /// Seed the last-known-good profile without applying it, e.g. from the
    /// store at daemon start.
    pub fn set_current(&self, profile: Profile) {
        *self.write_current() = Some(profile);
    }

    /// Validate and apply a candidate profile. On success (no rollback,
    /// only offline skips at worst) the candidate becomes the
    /// last-known-good profile.
    pub fn apply_profile(&self, candidate: &Profile) -> Result<EnforcementResult, EngineError> {
        let _guard = self.lock_apply();
        // Held across validate, write, and any rollback: an in-flight
        // apply is not cancellable, callers can only wait it out.

        let topo = topology::snapshot(self.iface.as_ref())?;
        validate(candidate, &topo).map_err(EngineError::Invalid)?;

        let result = enforce::apply(self.iface.as_ref(), candidate, self.write_order)?;
        if result.is_success() {
            *self.write_current() = Some(candidate.clone());
            info!(
                "profile `{}` applied to {} core(s), {} offline skip(s)",
                candidate.name,
                result.applied.len(),
                result.failed.len()
            );
        } else {
            warn!(
                "profile `{}` failed on {} core(s), rolled_back={}",
                candidate.name,
                result.genuine_failures().count(),
                result.rolled_back
            );
        }
        Ok(result)
    }

    /// Re-apply the last-known-good profile, if any. Used by the event
    /// watcher after hot-plug and resume.
    pub fn reenforce(&self) -> Result<Option<EnforcementResult>, EngineError> {
        let Some(profile) = self.current_profile() else {
            return Ok(None);
        };
        self.apply_profile(&profile).map(Some)
    }

    fn lock_apply(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        // A poisoned lock only means a previous apply panicked; the
        // hardware state is still re-derivable, so keep going.
        self.state_lock.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_current(&self) -> std::sync::RwLockReadGuard<'_, Option<Profile>> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_current(&self) -> std::sync::RwLockWriteGuard<'_, Option<Profile>> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::profile::CorePolicy;
    use crate::selector::CoreSelector;
    use crate::testutil::FakeScaling;

    fn entry(selector: &str, min: u32, max: u32, governor: &str) -> CorePolicy {
        CorePolicy {
            selector: CoreSelector::parse(selector).unwrap(),
            min_khz: min,
            max_khz: max,
            governor: governor.to_string(),
            energy_pref: None,
            turbo: None,
            online: None,
        }
    }

    #[test]
    fn invalid_profile_never_reaches_the_hardware() {
        let fake = Arc::new(FakeScaling::with_identical_cores(2, 800_000, 3_500_000));
        let engine = PolicyEngine::new(fake.clone(), WriteOrder::GovernorFirst);

        let mut profile = Profile::new("bad");
        profile.entries.push(entry("0", 800_000, 3_500_000, "nonexistent"));

        match engine.apply_profile(&profile) {
            Err(EngineError::Invalid(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(
                    errors[0],
                    ValidationError::UnsupportedGovernor { core: 0, .. }
                ));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert_eq!(fake.write_count(), 0);
        assert!(engine.current_profile().is_none());
    }

    #[test]
    fn successful_apply_becomes_last_known_good() {
        let fake = Arc::new(FakeScaling::with_identical_cores(2, 800_000, 3_500_000));
        let engine = PolicyEngine::new(fake, WriteOrder::GovernorFirst);

        let mut profile = Profile::new("good");
        profile.entries.push(entry("all", 1_000_000, 3_000_000, "performance"));

        let result = engine.apply_profile(&profile).unwrap();
        assert!(result.is_success());
        assert_eq!(engine.current_profile().unwrap().name, "good");
    }

    #[test]
    fn rolled_back_apply_keeps_previous_profile() {
        let fake = Arc::new(FakeScaling::with_identical_cores(2, 800_000, 3_500_000));
        let engine = PolicyEngine::new(fake.clone(), WriteOrder::GovernorFirst);

        let mut first = Profile::new("first");
        first.entries.push(entry("all", 900_000, 3_200_000, "performance"));
        assert!(engine.apply_profile(&first).unwrap().is_success());

        fake.reject_writes(1, "scaling_max_freq");
        let mut second = Profile::new("second");
        second.entries.push(entry("all", 800_000, 2_000_000, "powersave"));

        let result = engine.apply_profile(&second).unwrap();
        assert!(result.rolled_back);
        assert_eq!(engine.current_profile().unwrap().name, "first");
    }

    #[test]
    fn reenforce_skips_unplugged_cores() {
        let fake = Arc::new(FakeScaling::with_identical_cores(2, 800_000, 3_500_000));
        let engine = PolicyEngine::new(fake.clone(), WriteOrder::GovernorFirst);

        let mut profile = Profile::new("p");
        profile.entries.push(entry("0", 1_200_000, 3_500_000, "performance"));
        profile.entries.push(entry("1", 800_000, 2_000_000, "powersave"));
        assert!(engine.apply_profile(&profile).unwrap().is_success());

        fake.force_offline(1);
        let result = engine.reenforce().unwrap().unwrap();
        assert!(result.failed[&1].is_offline());
        assert!(result.applied.contains(&0));
        assert!(result.is_success());
        assert_eq!(fake.live_policy(0).unwrap().governor, "performance");
    }

    #[test]
    fn reenforce_without_profile_is_a_noop() {
        let fake = Arc::new(FakeScaling::with_identical_cores(1, 800_000, 3_500_000));
        let engine = PolicyEngine::new(fake, WriteOrder::GovernorFirst);
        assert!(engine.reenforce().unwrap().is_none());
    }
}
