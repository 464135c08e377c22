//! Policy evaluator — turns an observed statistic into a scaling decision.
//!
//! # Target tracking
//!
//! ```text
//! band = target_value * dead_band%
//!
//! if |statistic - target_value| <= band:
//!     no-op (within-dead-band)
//!
//! if statistic > up_target * (1 + dead_band%):
//!     desired = ceil(max(current, 1) * statistic / up_target)
//!
//! if statistic < down_target * (1 - dead_band%):
//!     desired = ceil(current * statistic / down_target)
//! ```
//!
//! Scale-up and scale-down are mutually exclusive per cycle. If both
//! would fire, scale-up wins.
//!
//! # Vertical recommendation
//!
//! Request = ceil(percentile * headroom), limit = ceil(request * ratio),
//! computed for CPU and memory independently. Growth applies at once;
//! shrinking waits until the series has a full window of history, the
//! window has no gap longer than a tenth of its length, and the window
//! maximum (with headroom) stays under the current request.

use tracing::{debug, warn};

use gridscale_core::{
    duration_millis, Capacity, PolicyKind, ReasonCode, ResourceRequirements, Resources,
    ScalableTarget, ScalingDecision, ScalingPolicy, StepAdjustment, Timestamp, VerticalSettings,
};
use gridscale_metrics::UsageProfile;

/// What the aggregator could tell about a target this cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// The window held no samples; evaluation is skipped.
    NoData,
    /// Windowed statistic for horizontal policies.
    Statistic(f64),
    /// CPU and memory usage for vertical policies.
    Usage { cpu: UsageProfile, memory: UsageProfile },
}

/// Evaluate `policy` for `target` against this cycle's observation.
///
/// Never fails: missing data or a mismatched observation yields a no-op
/// decision with reason `insufficient-data`.
pub fn evaluate(
    target: &ScalableTarget,
    policy: &ScalingPolicy,
    observation: &Observation,
    now: Timestamp,
) -> ScalingDecision {
    let decision = match (&policy.kind, &target.capacity, observation) {
        (PolicyKind::TargetTracking, Capacity::Count(current), Observation::Statistic(stat)) => {
            target_tracking(target, policy, *current, *stat, now)
        }
        (PolicyKind::Step { steps }, Capacity::Count(current), Observation::Statistic(stat)) => {
            step(target, policy, steps, *current, *stat, now)
        }
        (
            PolicyKind::VerticalRecommendation(settings),
            Capacity::Resources(current),
            Observation::Usage { cpu, memory },
        ) => vertical(target, policy, settings, current, cpu, memory, now),
        _ => ScalingDecision::noop(target, ReasonCode::InsufficientData, None, now),
    };

    debug!(
        target_id = %target.id,
        current = %target.capacity,
        proposed = ?decision.proposed.map(|c| c.to_string()),
        reason = %decision.reason,
        statistic = ?decision.statistic,
        "policy evaluated"
    );
    decision
}

fn within_dead_band(policy: &ScalingPolicy, stat: f64) -> bool {
    (stat - policy.target_value).abs() <= policy.target_value * policy.dead_band()
}

fn target_tracking(
    target: &ScalableTarget,
    policy: &ScalingPolicy,
    current: u32,
    stat: f64,
    now: Timestamp,
) -> ScalingDecision {
    if within_dead_band(policy, stat) {
        return ScalingDecision::noop(target, ReasonCode::WithinDeadBand, Some(stat), now);
    }

    let band = policy.dead_band();
    let up = (stat > policy.up_target() * (1.0 + band))
        .then(|| proportional(current.max(1), stat, policy.up_target()))
        .filter(|desired| *desired > current);
    let down = (stat < policy.down_target() * (1.0 - band))
        .then(|| proportional(current, stat, policy.down_target()))
        .filter(|desired| *desired < current);

    resolve(target, up, down, (ReasonCode::ScaleUp, ReasonCode::ScaleDown), stat, now)
}

fn step(
    target: &ScalableTarget,
    policy: &ScalingPolicy,
    steps: &[StepAdjustment],
    current: u32,
    stat: f64,
    now: Timestamp,
) -> ScalingDecision {
    if within_dead_band(policy, stat) {
        return ScalingDecision::noop(target, ReasonCode::WithinDeadBand, Some(stat), now);
    }

    let select = |breach: f64| steps.iter().find(|s| s.contains(breach));
    let up = (stat > policy.up_target())
        .then(|| select(stat - policy.up_target()))
        .flatten()
        .map(|s| current.saturating_add(s.adjustment));
    let down = (stat < policy.down_target())
        .then(|| select(policy.down_target() - stat))
        .flatten()
        .map(|s| current.saturating_sub(s.adjustment))
        .filter(|desired| *desired < current);

    resolve(target, up, down, (ReasonCode::StepUp, ReasonCode::StepDown), stat, now)
}

/// Pick between scale-up and scale-down candidates, preferring scale-up.
fn resolve(
    target: &ScalableTarget,
    up: Option<u32>,
    down: Option<u32>,
    (up_reason, down_reason): (ReasonCode, ReasonCode),
    stat: f64,
    now: Timestamp,
) -> ScalingDecision {
    match (up, down) {
        (Some(desired), Some(suppressed)) => {
            warn!(
                target_id = %target.id,
                desired,
                suppressed,
                statistic = stat,
                reason = %ReasonCode::ScaleDownSuppressed,
                "scale-up and scale-down both triggered; keeping scale-up"
            );
            ScalingDecision::propose(target, Capacity::Count(desired), up_reason, Some(stat), now)
        }
        (Some(desired), None) => {
            ScalingDecision::propose(target, Capacity::Count(desired), up_reason, Some(stat), now)
        }
        (None, Some(desired)) => {
            ScalingDecision::propose(target, Capacity::Count(desired), down_reason, Some(stat), now)
        }
        (None, None) => ScalingDecision::noop(target, ReasonCode::Unchanged, Some(stat), now),
    }
}

/// ceil(current * statistic / target), saturating at `u32::MAX`.
fn proportional(current: u32, stat: f64, target: f64) -> u32 {
    (current as f64 * stat / target).ceil().max(0.0) as u32
}

fn vertical(
    target: &ScalableTarget,
    policy: &ScalingPolicy,
    settings: &VerticalSettings,
    current: &ResourceRequirements,
    cpu: &UsageProfile,
    memory: &UsageProfile,
    now: Timestamp,
) -> ScalingDecision {
    let window_ms = duration_millis(policy.window);
    let requests = Resources {
        cpu_millis: recommend(current.requests.cpu_millis, cpu, settings.headroom, window_ms, now),
        memory_bytes: recommend(
            current.requests.memory_bytes,
            memory,
            settings.headroom,
            window_ms,
            now,
        ),
    };

    if requests == current.requests {
        return ScalingDecision::noop(target, ReasonCode::VerticalHold, None, now);
    }

    let ratio = settings.limit_to_request_ratio;
    let limits = Resources {
        cpu_millis: scaled(requests.cpu_millis, ratio),
        memory_bytes: scaled(requests.memory_bytes, ratio),
    };
    let grew = requests.cpu_millis > current.requests.cpu_millis
        || requests.memory_bytes > current.requests.memory_bytes;
    let reason = if grew {
        ReasonCode::VerticalGrow
    } else {
        ReasonCode::VerticalShrink
    };

    ScalingDecision::propose(
        target,
        Capacity::Resources(ResourceRequirements { requests, limits }),
        reason,
        None,
        now,
    )
}

/// A shrink needs samples spread across the window: no stretch longer
/// than `window / GAP_TOLERANCE_DIVISOR` may be missing.
const GAP_TOLERANCE_DIVISOR: u64 = 10;

/// Recommended request for one resource.
fn recommend(
    current: u64,
    usage: &UsageProfile,
    headroom: f64,
    window_ms: u64,
    now: Timestamp,
) -> u64 {
    let recommended = scaled_f64(usage.percentile, headroom);
    if recommended >= current {
        return recommended;
    }

    let full_history = now.saturating_sub(usage.first_seen) >= window_ms;
    let covered = usage.longest_gap <= window_ms / GAP_TOLERANCE_DIVISOR;
    let consistently_low = usage.max * headroom < current as f64;
    if full_history && covered && consistently_low {
        recommended
    } else {
        current
    }
}

fn scaled(value: u64, factor: f64) -> u64 {
    scaled_f64(value as f64, factor)
}

fn scaled_f64(value: f64, factor: f64) -> u64 {
    (value * factor).ceil().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    const HOUR_MS: u64 = 3_600_000;

    fn web(current: u32) -> ScalableTarget {
        ScalableTarget::horizontal("web", current, 1, 5)
    }

    fn policy(target_value: f64) -> ScalingPolicy {
        ScalingPolicy::target_tracking("web", "cpu", target_value)
    }

    fn proposed_count(decision: &ScalingDecision) -> Option<u32> {
        decision.proposed.and_then(|c| c.count())
    }

    #[test]
    fn scales_up_proportionally() {
        let d = evaluate(&web(2), &policy(50.0), &Observation::Statistic(90.0), 0);
        assert_eq!(proposed_count(&d), Some(4));
        assert_eq!(d.reason, ReasonCode::ScaleUp);
    }

    #[test]
    fn scales_down_proportionally() {
        let d = evaluate(&web(2), &policy(30.0), &Observation::Statistic(10.0), 0);
        assert_eq!(proposed_count(&d), Some(1));
        assert_eq!(d.reason, ReasonCode::ScaleDown);
    }

    #[test]
    fn separate_scale_targets() {
        let p = policy(40.0).with_scale_targets(Some(50.0), Some(30.0));

        let up = evaluate(&web(2), &p, &Observation::Statistic(90.0), 0);
        assert_eq!(proposed_count(&up), Some(4));

        let down = evaluate(&web(3), &p, &Observation::Statistic(10.0), 0);
        assert_eq!(proposed_count(&down), Some(1));

        // Between the two thresholds nothing fires.
        let hold = evaluate(&web(3), &p, &Observation::Statistic(33.0), 0);
        assert!(hold.is_noop());
    }

    #[test]
    fn overlapping_thresholds_prefer_scale_up() {
        // Misconfigured: scale-down target above scale-up target.
        let p = policy(100.0)
            .with_scale_targets(Some(20.0), Some(80.0))
            .with_dead_band(0.0);
        let d = evaluate(&web(2), &p, &Observation::Statistic(40.0), 0);
        assert_eq!(d.reason, ReasonCode::ScaleUp);
        assert_eq!(proposed_count(&d), Some(4));
    }

    #[test]
    fn no_data_is_insufficient() {
        let d = evaluate(&web(2), &policy(50.0), &Observation::NoData, 7);
        assert!(d.is_noop());
        assert_eq!(d.reason, ReasonCode::InsufficientData);
        assert_eq!(d.timestamp, 7);
    }

    #[test]
    fn scale_up_from_zero() {
        let target = ScalableTarget::horizontal("web", 0, 0, 5);
        let d = evaluate(&target, &policy(50.0), &Observation::Statistic(120.0), 0);
        assert_eq!(proposed_count(&d), Some(3));
    }

    #[test]
    fn step_policy_selects_band() {
        let steps = vec![
            StepAdjustment {
                lower_bound: 0.0,
                upper_bound: Some(20.0),
                adjustment: 1,
            },
            StepAdjustment {
                lower_bound: 20.0,
                upper_bound: None,
                adjustment: 3,
            },
        ];
        let p = ScalingPolicy::step("web", "cpu", 50.0, steps).with_dead_band(0.0);

        let small = evaluate(&web(2), &p, &Observation::Statistic(60.0), 0);
        assert_eq!(proposed_count(&small), Some(3));
        assert_eq!(small.reason, ReasonCode::StepUp);

        let large = evaluate(&web(2), &p, &Observation::Statistic(95.0), 0);
        assert_eq!(proposed_count(&large), Some(5));

        let down = evaluate(&web(4), &p, &Observation::Statistic(40.0), 0);
        assert_eq!(proposed_count(&down), Some(3));
        assert_eq!(down.reason, ReasonCode::StepDown);
    }

    fn pod(cpu: u64, mem: u64) -> ScalableTarget {
        let current = ResourceRequirements {
            requests: Resources::new(cpu, mem),
            limits: Resources::new(cpu * 2, mem * 2),
        };
        let max = Resources::new(8000, 1 << 34);
        ScalableTarget::vertical("api", current, Resources::new(10, 1), max)
    }

    fn vpa() -> ScalingPolicy {
        ScalingPolicy::vertical(
            "api",
            VerticalSettings {
                limit_to_request_ratio: 2.0,
                ..VerticalSettings::default()
            },
            Duration::from_secs(3600),
        )
    }

    fn usage(p: f64, max: f64, first_seen: Timestamp) -> UsageProfile {
        UsageProfile {
            percentile: p,
            max,
            samples: 100,
            first_seen,
            longest_gap: 60_000,
        }
    }

    #[test]
    fn vertical_grows_immediately() {
        let obs = Observation::Usage {
            cpu: usage(500.0, 600.0, 0),
            memory: usage(100.0, 100.0, 0),
        };
        // Brand-new history: growth is not gated on a full window.
        let d = evaluate(&pod(250, 100), &vpa(), &obs, 1_000);
        let reqs = *d.proposed.unwrap().requirements().unwrap();
        assert_eq!(reqs.requests.cpu_millis, 600);
        assert_eq!(reqs.limits.cpu_millis, 1200);
        assert_eq!(d.reason, ReasonCode::VerticalGrow);
    }

    #[test]
    fn vertical_shrink_waits_for_full_window() {
        let obs = Observation::Usage {
            cpu: usage(100.0, 120.0, 0),
            memory: usage(100.0, 100.0, 0),
        };
        // Only half an hour of history.
        let d = evaluate(&pod(1000, 120), &vpa(), &obs, HOUR_MS / 2);
        assert!(d.is_noop());
        assert_eq!(d.reason, ReasonCode::VerticalHold);

        // A full hour of consistently low usage.
        let d = evaluate(&pod(1000, 120), &vpa(), &obs, HOUR_MS);
        let reqs = *d.proposed.unwrap().requirements().unwrap();
        assert_eq!(reqs.requests.cpu_millis, 120);
        assert_eq!(d.reason, ReasonCode::VerticalShrink);
    }

    #[test]
    fn vertical_shrink_blocked_by_transient_spike() {
        // p95 is low but the window max (with headroom) exceeds the request.
        let obs = Observation::Usage {
            cpu: usage(100.0, 900.0, 0),
            memory: usage(100.0, 100.0, 0),
        };
        let d = evaluate(&pod(1000, 120), &vpa(), &obs, 2 * HOUR_MS);
        assert!(d.is_noop());
    }

    #[test]
    fn vertical_shrink_needs_samples_across_the_window() {
        // Old history, then an outage: one idle sample after the gap.
        let sparse = UsageProfile {
            samples: 1,
            longest_gap: HOUR_MS - 1_000,
            ..usage(20.0, 20.0, 0)
        };
        let obs = Observation::Usage {
            cpu: sparse,
            memory: UsageProfile {
                samples: 1,
                longest_gap: HOUR_MS - 1_000,
                ..usage(10.0, 10.0, 0)
            },
        };
        let d = evaluate(&pod(1000, 120), &vpa(), &obs, 3 * HOUR_MS);
        assert!(d.is_noop());
        assert_eq!(d.reason, ReasonCode::VerticalHold);

        // A gap right at the tolerance still counts as covered.
        let covered = Observation::Usage {
            cpu: UsageProfile {
                longest_gap: HOUR_MS / 10,
                ..usage(20.0, 20.0, 0)
            },
            memory: usage(100.0, 100.0, 0),
        };
        let d = evaluate(&pod(1000, 120), &vpa(), &covered, 3 * HOUR_MS);
        assert_eq!(d.reason, ReasonCode::VerticalShrink);
    }

    #[test]
    fn mismatched_observation_is_insufficient() {
        let d = evaluate(&pod(250, 100), &vpa(), &Observation::Statistic(10.0), 0);
        assert_eq!(d.reason, ReasonCode::InsufficientData);
    }

    proptest! {
        #[test]
        fn dead_band_is_noop(
            target_value in 1.0f64..1_000.0,
            band in 0.0f64..50.0,
            offset in -0.99f64..0.99,
            current in 0u32..100,
            stepped in any::<bool>(),
        ) {
            let stat = target_value * (1.0 + offset * band / 100.0);
            let p = if stepped {
                let steps = vec![StepAdjustment {
                    lower_bound: 0.0,
                    upper_bound: None,
                    adjustment: 1,
                }];
                ScalingPolicy::step("web", "cpu", target_value, steps)
            } else {
                policy(target_value)
            };
            let p = p.with_dead_band(band);
            let target = ScalableTarget::horizontal("web", current, 0, 100);

            let d = evaluate(&target, &p, &Observation::Statistic(stat), 0);
            prop_assert!(d.is_noop(), "stat {} proposed {:?}", stat, d.proposed);
            prop_assert_eq!(d.reason, ReasonCode::WithinDeadBand);
        }
    }
}
