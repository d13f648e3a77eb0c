// SPDX-License-Identifier: GPL-2.0
//
// freqd: profile enforcement.
//
// An apply is all-or-nothing with respect to genuine write failures:
// every core's pre-state is captured before the first write touches it,
// and if any non-offline failure occurs the captured states are replayed
// over everything this invocation changed. Cores that are legitimately
// absent are skipped and recorded, never fatal to the batch.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ApplyFailure, TopologyError};
use crate::profile::Profile;
use crate::sysfs::{LivePolicy, ScalingInterface};

/// Relative order of the governor write and the bounds writes. Some
/// drivers reject a bound outside the active governor's range unless the
/// governor is switched first; others want the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteOrder {
    #[default]
    GovernorFirst,
    BoundsFirst,
}

/// Fully resolved per-core target, after selector resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreTarget {
    pub governor: String,
    pub min_khz: u32,
    pub max_khz: u32,
    pub energy_pref: Option<String>,
    pub online: Option<bool>,
}

/// Outcome of one apply invocation. Produced once, never mutated after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementResult {
    /// Cores whose live state equals the target after this invocation.
    pub applied: BTreeSet<u32>,
    /// Cores that could not be brought to the target, and why.
    pub failed: BTreeMap<u32, ApplyFailure>,
    /// Failure of the machine-global turbo write, if one was needed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turbo_failure: Option<ApplyFailure>,
    /// Whether this invocation reverted its own changes.
    pub rolled_back: bool,
}

impl EnforcementResult {
    fn new() -> Self {
        EnforcementResult {
            applied: BTreeSet::new(),
            failed: BTreeMap::new(),
            turbo_failure: None,
            rolled_back: false,
        }
    }

    /// True when nothing went wrong beyond offline skips.
    pub fn is_success(&self) -> bool {
        !self.rolled_back
            && self.turbo_failure.is_none()
            && self.failed.values().all(ApplyFailure::is_offline)
    }

    /// Genuine (non-offline) per-core failures.
    pub fn genuine_failures(&self) -> impl Iterator<Item = (&u32, &ApplyFailure)> {
        self.failed.iter().filter(|(_, f)| !f.is_offline())
    }
}

/// Resolve every profile entry to concrete core targets against the given
/// present-core set. Selectors were validated not to overlap.
pub fn resolve_targets(profile: &Profile, present: &[u32]) -> BTreeMap<u32, CoreTarget> {
    let mut targets = BTreeMap::new();
    for entry in &profile.entries {
        for core in entry.selector.resolve(present) {
            targets.insert(
                core,
                CoreTarget {
                    governor: entry.governor.clone(),
                    min_khz: entry.min_khz,
                    max_khz: entry.max_khz,
                    energy_pref: entry.energy_pref.clone(),
                    online: entry.online,
                },
            );
        }
    }
    targets
}

/// Which attributes of one core diverge from its target.
pub fn drift_fields(live: &LivePolicy, target: &CoreTarget) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if !live.online {
        if target.online == Some(true) {
            fields.push("online");
        }
        return fields;
    }
    if target.online == Some(false) {
        fields.push("online");
        return fields;
    }
    if live.governor != target.governor {
        fields.push("governor");
    }
    if live.min_khz != target.min_khz {
        fields.push("min_khz");
    }
    if live.max_khz != target.max_khz {
        fields.push("max_khz");
    }
    if let Some(pref) = &target.energy_pref {
        if live.energy_pref.as_deref() != Some(pref.as_str()) {
            fields.push("energy_pref");
        }
    }
    fields
}

/// Compare a profile against live state without writing anything.
/// Offline cores with no online request are reported as absent drift-free.
pub fn diff_live(
    iface: &dyn ScalingInterface,
    profile: &Profile,
) -> Result<BTreeMap<u32, Vec<&'static str>>, TopologyError> {
    let present = iface.present_cores()?;
    let targets = resolve_targets(profile, &present);
    let mut drift = BTreeMap::new();
    for (core, target) in &targets {
        let live = iface.live_policy(*core)?;
        let fields = drift_fields(&live, target);
        if !fields.is_empty() {
            drift.insert(*core, fields);
        }
    }
    Ok(drift)
}

/// Apply a validated profile to live cores.
pub fn apply(
    iface: &dyn ScalingInterface,
    profile: &Profile,
    order: WriteOrder,
) -> Result<EnforcementResult, TopologyError> {
    let present = iface.present_cores()?;
    let targets = resolve_targets(profile, &present);
    let mut result = EnforcementResult::new();

    // Pre-states of every core this invocation wrote to, in write order.
    let mut changed: Vec<(u32, LivePolicy)> = Vec::new();

    for (&core, target) in &targets {
        match apply_core(iface, core, target, order, &mut changed) {
            Ok(()) => {
                result.applied.insert(core);
            }
            Err(failure) => {
                result.failed.insert(core, failure);
            }
        }
    }

    // Turbo is machine-global; one write per invocation at most.
    let mut turbo_restore = None;
    if let Some(want) = profile.turbo_request() {
        match iface.turbo_enabled() {
            Some(current) if current != want => match iface.set_turbo(want) {
                Ok(()) => turbo_restore = Some(current),
                Err(e) => result.turbo_failure = Some(e),
            },
            Some(_) => {}
            None => {
                result.turbo_failure = Some(ApplyFailure::WriteRejected {
                    attr: "turbo".to_string(),
                    value: want.to_string(),
                    reason: "no turbo/boost toggle exposed".to_string(),
                });
            }
        }
    }

    let must_roll_back =
        result.turbo_failure.is_some() || result.failed.values().any(|f| !f.is_offline());

    if must_roll_back {
        for (core, pre) in changed.iter().rev() {
            replay(iface, *core, pre);
            result.applied.remove(core);
        }
        if let Some(previous) = turbo_restore {
            if let Err(e) = iface.set_turbo(previous) {
                warn!("rollback: restoring turbo={previous} failed: {e}");
            }
        }
        result.rolled_back = true;
    }

    debug!(
        "apply `{}`: {} applied, {} failed, rolled_back={}",
        profile.name,
        result.applied.len(),
        result.failed.len(),
        result.rolled_back
    );
    Ok(result)
}

fn read_pre(iface: &dyn ScalingInterface, core: u32) -> Result<LivePolicy, ApplyFailure> {
    iface.live_policy(core).map_err(|e| ApplyFailure::WriteRejected {
        attr: "live state".to_string(),
        value: String::new(),
        reason: e.to_string(),
    })
}

fn apply_core(
    iface: &dyn ScalingInterface,
    core: u32,
    target: &CoreTarget,
    order: WriteOrder,
    changed: &mut Vec<(u32, LivePolicy)>,
) -> Result<(), ApplyFailure> {
    let online_now = iface.is_online(core);

    if target.online == Some(false) {
        if !online_now {
            return Ok(());
        }
        let pre = read_pre(iface, core)?;
        iface.set_online(core, false)?;
        changed.push((core, pre));
        return Ok(());
    }

    if !online_now {
        if target.online != Some(true) {
            return Err(ApplyFailure::CoreOffline);
        }
        let pre = read_pre(iface, core)?;
        iface.set_online(core, true)?;
        changed.push((core, pre));
    }

    let live = read_pre(iface, core)?;
    let drift = drift_fields(&live, target);
    if drift.is_empty() {
        // Already at target; zero writes.
        return Ok(());
    }

    // Capture before the first mutation, unless onlining already did.
    if !changed.iter().any(|(c, _)| *c == core) {
        changed.push((core, live.clone()));
    }

    let governor_step = |iface: &dyn ScalingInterface| -> Result<(), ApplyFailure> {
        if live.governor != target.governor {
            iface.write_governor(core, &target.governor)?;
        }
        Ok(())
    };
    let bounds_step = |iface: &dyn ScalingInterface| -> Result<(), ApplyFailure> {
        write_bounds(iface, core, &live, target.min_khz, target.max_khz)
    };

    match order {
        WriteOrder::GovernorFirst => {
            governor_step(iface)?;
            bounds_step(iface)?;
        }
        WriteOrder::BoundsFirst => {
            bounds_step(iface)?;
            governor_step(iface)?;
        }
    }

    if let Some(pref) = &target.energy_pref {
        if live.energy_pref.as_deref() != Some(pref.as_str()) {
            iface.write_energy_pref(core, pref)?;
        }
    }

    Ok(())
}

/// Write both bounds keeping `scaling_min <= scaling_max` true at every
/// intermediate step, skipping bounds that already match.
fn write_bounds(
    iface: &dyn ScalingInterface,
    core: u32,
    live: &LivePolicy,
    min_khz: u32,
    max_khz: u32,
) -> Result<(), ApplyFailure> {
    if max_khz < live.min_khz {
        if live.min_khz != min_khz {
            iface.write_min_khz(core, min_khz)?;
        }
        if live.max_khz != max_khz {
            iface.write_max_khz(core, max_khz)?;
        }
    } else {
        if live.max_khz != max_khz {
            iface.write_max_khz(core, max_khz)?;
        }
        if live.min_khz != min_khz {
            iface.write_min_khz(core, min_khz)?;
        }
    }
    Ok(())
}

/// Best-effort replay of a captured pre-state onto one core. Failures here
/// are logged; there is nothing further to fall back to.
fn replay(iface: &dyn ScalingInterface, core: u32, pre: &LivePolicy) {
    if !pre.online {
        if let Err(e) = iface.set_online(core, false) {
            warn!("rollback: offlining core {core} failed: {e}");
        }
        return;
    }

    if !iface.is_online(core) {
        if let Err(e) = iface.set_online(core, true) {
            warn!("rollback: onlining core {core} failed: {e}");
            return;
        }
    }

    let live = match iface.live_policy(core) {
        Ok(live) => live,
        Err(e) => {
            warn!("rollback: reading core {core} failed: {e}");
            return;
        }
    };

    if live.governor != pre.governor {
        if let Err(e) = iface.write_governor(core, &pre.governor) {
            warn!("rollback: restoring governor on core {core} failed: {e}");
        }
    }
    if let Err(e) = write_bounds(iface, core, &live, pre.min_khz, pre.max_khz) {
        warn!("rollback: restoring bounds on core {core} failed: {e}");
    }
    if let Some(pref) = &pre.energy_pref {
        if live.energy_pref.as_deref() != Some(pref.as_str()) {
            if let Err(e) = iface.write_energy_pref(core, pref) {
                warn!("rollback: restoring energy preference on core {core} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::CorePolicy;
    use crate::selector::CoreSelector;
    use crate::testutil::{FakeScaling, TURBO_CORE};

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

    /// core0 performance 1.2-3.5 GHz, core1 powersave 0.8-2.0 GHz.
    fn split_profile() -> Profile {
        let mut p = Profile::new("split");
        p.entries.push(entry("0", 1_200_000, 3_500_000, "performance"));
        p.entries.push(entry("1", 800_000, 2_000_000, "powersave"));
        p
    }

    #[test]
    fn apply_brings_cores_to_target() {
        let fake = FakeScaling::with_identical_cores(2, 800_000, 3_500_000);
        let result = apply(&fake, &split_profile(), WriteOrder::GovernorFirst).unwrap();

        assert_eq!(result.applied, BTreeSet::from([0, 1]));
        assert!(result.failed.is_empty());
        assert!(!result.rolled_back);

        let live0 = fake.live_policy(0).unwrap();
        assert_eq!(live0.governor, "performance");
        assert_eq!(live0.min_khz, 1_200_000);
        assert_eq!(live0.max_khz, 3_500_000);
        let live1 = fake.live_policy(1).unwrap();
        assert_eq!(live1.governor, "powersave");
        assert_eq!(live1.min_khz, 800_000);
        assert_eq!(live1.max_khz, 2_000_000);
    }

    #[test]
    fn second_apply_performs_zero_writes() {
        let fake = FakeScaling::with_identical_cores(2, 800_000, 3_500_000);
        let profile = split_profile();

        apply(&fake, &profile, WriteOrder::GovernorFirst).unwrap();
        let live_after_first: Vec<_> =
            (0..2).map(|c| fake.live_policy(c).unwrap()).collect();

        fake.clear_writes();
        let result = apply(&fake, &profile, WriteOrder::GovernorFirst).unwrap();

        assert_eq!(fake.write_count(), 0);
        assert_eq!(result.applied, BTreeSet::from([0, 1]));
        assert!(!result.rolled_back);
        let live_after_second: Vec<_> =
            (0..2).map(|c| fake.live_policy(c).unwrap()).collect();
        assert_eq!(live_after_first, live_after_second);
    }

    #[test]
    fn governor_first_order_is_respected() {
        let fake = FakeScaling::with_identical_cores(1, 800_000, 3_500_000);
        let mut p = Profile::new("one");
        p.entries.push(entry("0", 1_000_000, 3_000_000, "performance"));

        apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();
        let writes = fake.writes();
        assert_eq!(writes[0], "cpu0/scaling_governor=performance");

        let fake = FakeScaling::with_identical_cores(1, 800_000, 3_500_000);
        apply(&fake, &p, WriteOrder::BoundsFirst).unwrap();
        let writes = fake.writes();
        assert!(writes[0].starts_with("cpu0/scaling_m"));
        assert_eq!(writes.last().unwrap(), "cpu0/scaling_governor=performance");
    }

    #[test]
    fn bounds_never_cross_mid_write() {
        let fake = FakeScaling::with_identical_cores(1, 200_000, 4_000_000);
        // Live: 1000-2000. Target: 500-800 (entirely below live min).
        fake.write_min_khz(0, 1_000_000).unwrap();
        fake.write_max_khz(0, 2_000_000).unwrap();
        fake.clear_writes();

        let mut p = Profile::new("low");
        p.entries.push(entry("0", 500_000, 800_000, "powersave"));
        apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();

        assert_eq!(
            fake.writes(),
            vec!["cpu0/scaling_min_freq=500000", "cpu0/scaling_max_freq=800000"]
        );
    }

    #[test]
    fn offline_core_is_skipped_not_fatal() {
        let fake = FakeScaling::with_identical_cores(2, 800_000, 3_500_000);
        fake.force_offline(1);

        let result = apply(&fake, &split_profile(), WriteOrder::GovernorFirst).unwrap();

        assert_eq!(result.applied, BTreeSet::from([0]));
        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[&1].is_offline());
        assert!(!result.rolled_back);
        assert!(result.is_success());

        // Core 0 still got its policy.
        assert_eq!(fake.live_policy(0).unwrap().governor, "performance");
    }

    #[test]
    fn write_failure_rolls_back_the_whole_batch() {
        let fake = FakeScaling::with_identical_cores(2, 800_000, 3_500_000);
        let pre0 = fake.live_policy(0).unwrap();
        fake.reject_writes(1, "scaling_max_freq");

        let result = apply(&fake, &split_profile(), WriteOrder::GovernorFirst).unwrap();

        assert!(result.rolled_back);
        assert!(!result.is_success());
        assert!(result.applied.is_empty());
        assert!(matches!(
            result.failed[&1],
            ApplyFailure::WriteRejected { .. }
        ));

        // Core 0 was changed, then reverted to its pre-apply state.
        assert_eq!(fake.live_policy(0).unwrap(), pre0);
    }

    #[test]
    fn entry_can_online_a_core_then_policy_lands() {
        let fake = FakeScaling::with_identical_cores(2, 800_000, 3_500_000);
        fake.force_offline(1);

        let mut p = Profile::new("wake");
        let mut e = entry("1", 800_000, 2_000_000, "performance");
        e.online = Some(true);
        p.entries.push(e);

        let result = apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();
        assert_eq!(result.applied, BTreeSet::from([1]));
        let live = fake.live_policy(1).unwrap();
        assert!(live.online);
        assert_eq!(live.governor, "performance");
        assert_eq!(live.max_khz, 2_000_000);
    }

    #[test]
    fn entry_can_offline_a_core() {
        let fake = FakeScaling::with_identical_cores(2, 800_000, 3_500_000);
        let mut p = Profile::new("park");
        let mut e = entry("1", 800_000, 3_500_000, "powersave");
        e.online = Some(false);
        p.entries.push(e);

        let result = apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();
        assert_eq!(result.applied, BTreeSet::from([1]));
        assert!(!fake.is_online(1));

        // Idempotent: already parked core needs no writes.
        fake.clear_writes();
        let result = apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();
        assert_eq!(fake.write_count(), 0);
        assert_eq!(result.applied, BTreeSet::from([1]));
    }

    #[test]
    fn rollback_restores_online_state() {
        let fake = FakeScaling::with_identical_cores(3, 800_000, 3_500_000);
        fake.force_offline(2);
        fake.reject_writes(0, "scaling_governor");

        let mut p = Profile::new("mixed");
        p.entries.push(entry("0", 800_000, 3_500_000, "performance"));
        let mut wake = entry("2", 800_000, 3_500_000, "performance");
        wake.online = Some(true);
        p.entries.push(wake);

        let result = apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();
        assert!(result.rolled_back);
        // The onlined core went back offline.
        assert!(!fake.is_online(2));
    }

    #[test]
    fn turbo_toggle_is_applied_and_rolled_back() {
        let fake = FakeScaling::with_identical_cores(1, 800_000, 3_500_000);
        fake.set_turbo_support(Some(true));

        let mut p = Profile::new("quiet");
        let mut e = entry("0", 800_000, 3_500_000, "powersave");
        e.turbo = Some(false);
        p.entries.push(e);

        let result = apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();
        assert!(result.is_success());
        assert_eq!(fake.turbo_enabled(), Some(false));

        // Now make the turbo write itself fail mid-batch.
        let fake = FakeScaling::with_identical_cores(1, 800_000, 3_500_000);
        fake.set_turbo_support(Some(true));
        fake.reject_writes(TURBO_CORE, "turbo");

        let mut p = Profile::new("quiet");
        let mut e = entry("0", 1_000_000, 3_000_000, "performance");
        e.turbo = Some(false);
        p.entries.push(e);

        let pre = fake.live_policy(0).unwrap();
        let result = apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();
        assert!(result.rolled_back);
        assert!(result.turbo_failure.is_some());
        assert_eq!(fake.live_policy(0).unwrap(), pre);
        assert_eq!(fake.turbo_enabled(), Some(true));
    }

    #[test]
    fn energy_preference_is_written_last() {
        let fake = FakeScaling::with_identical_cores(1, 800_000, 3_500_000);
        fake.set_energy_prefs(0, &["default", "power"], "default");

        let mut p = Profile::new("epp");
        let mut e = entry("0", 800_000, 3_500_000, "performance");
        e.energy_pref = Some("power".to_string());
        p.entries.push(e);

        let result = apply(&fake, &p, WriteOrder::GovernorFirst).unwrap();
        assert!(result.is_success());
        assert_eq!(
            fake.writes().last().unwrap(),
            "cpu0/energy_performance_preference=power"
        );
        assert_eq!(
            fake.live_policy(0).unwrap().energy_pref.as_deref(),
            Some("power")
        );
    }

    #[test]
    fn empty_profile_applies_as_noop() {
        let fake = FakeScaling::with_identical_cores(2, 800_000, 3_500_000);
        let result = apply(&fake, &Profile::new("noop"), WriteOrder::GovernorFirst).unwrap();
        assert!(result.applied.is_empty());
        assert!(result.failed.is_empty());
        assert!(result.is_success());
        assert_eq!(fake.write_count(), 0);
    }

    #[test]
    fn diff_live_reports_divergent_fields() {
        let fake = FakeScaling::with_identical_cores(2, 800_000, 3_500_000);
        let profile = split_profile();

        let drift = diff_live(&fake, &profile).unwrap();
        assert_eq!(drift[&0], vec!["governor", "min_khz"]);
        assert_eq!(drift[&1], vec!["max_khz"]);

        apply(&fake, &profile, WriteOrder::GovernorFirst).unwrap();
        assert!(diff_live(&fake, &profile).unwrap().is_empty());
    }

    #[test]
    fn enforcement_result_round_trips_as_json() {
        let mut result = EnforcementResult::new();
        result.applied.insert(0);
        result.failed.insert(1, ApplyFailure::CoreOffline);
        let json = serde_json::to_string(&result).unwrap();
        let back: EnforcementResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
