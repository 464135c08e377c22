//! Domain types for the gridscale engine.
//!
//! These types describe scalable targets, metric samples, scaling
//! decisions and the audit records emitted for every decision. All types
//! are serializable so hosts can forward them to their own logging or
//! metrics pipelines.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::quantity::{format_cpu, format_memory};

/// Unique identifier for a scalable target (an instance group or a pod).
pub type TargetId = String;

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn epoch_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// Convert a duration into timestamp units, saturating on overflow.
pub fn duration_millis(d: Duration) -> Timestamp {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ── Targets ───────────────────────────────────────────────────────

/// What kind of capacity a target exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A group of identical units scaled by count (ASG, deployment replicas).
    HorizontalGroup,
    /// A single workload resized by resource requests and limits.
    VerticalPod,
}

/// CPU and memory quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in millicores.
    pub cpu_millis: u64,
    /// Memory in bytes.
    pub memory_bytes: u64,
}

impl Resources {
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    fn clamp(self, min: Resources, max: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.clamp(min.cpu_millis, max.cpu_millis),
            memory_bytes: self.memory_bytes.clamp(min.memory_bytes, max.memory_bytes),
        }
    }

    fn within(&self, min: &Resources, max: &Resources) -> bool {
        (min.cpu_millis..=max.cpu_millis).contains(&self.cpu_millis)
            && (min.memory_bytes..=max.memory_bytes).contains(&self.memory_bytes)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} memory={}",
            format_cpu(self.cpu_millis),
            format_memory(self.memory_bytes)
        )
    }
}

/// Requests and limits for a vertically scaled workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub requests: Resources,
    pub limits: Resources,
}

/// Current capacity of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Capacity {
    /// Number of units in a horizontal group.
    Count(u32),
    /// Resource requests/limits of a vertical target.
    Resources(ResourceRequirements),
}

impl Capacity {
    pub fn kind(&self) -> TargetKind {
        match self {
            Capacity::Count(_) => TargetKind::HorizontalGroup,
            Capacity::Resources(_) => TargetKind::VerticalPod,
        }
    }

    /// The unit count, if this is a horizontal capacity.
    pub fn count(&self) -> Option<u32> {
        match self {
            Capacity::Count(n) => Some(*n),
            Capacity::Resources(_) => None,
        }
    }

    /// The requirements, if this is a vertical capacity.
    pub fn requirements(&self) -> Option<&ResourceRequirements> {
        match self {
            Capacity::Count(_) => None,
            Capacity::Resources(r) => Some(r),
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Count(n) => write!(f, "{n}"),
            Capacity::Resources(r) => write!(f, "requests[{}] limits[{}]", r.requests, r.limits),
        }
    }
}

/// Inclusive capacity bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapacityBounds {
    Count { min: u32, max: u32 },
    Resources { min: Resources, max: Resources },
}

/// Result of clamping a proposed capacity into bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clamped {
    pub capacity: Capacity,
    /// Set when the clamp changed the proposal.
    pub reason: Option<ReasonCode>,
}

impl CapacityBounds {
    pub fn kind(&self) -> TargetKind {
        match self {
            CapacityBounds::Count { .. } => TargetKind::HorizontalGroup,
            CapacityBounds::Resources { .. } => TargetKind::VerticalPod,
        }
    }

    /// Whether min <= max for every dimension.
    pub fn is_ordered(&self) -> bool {
        match self {
            CapacityBounds::Count { min, max } => min <= max,
            CapacityBounds::Resources { min, max } => {
                min.cpu_millis <= max.cpu_millis && min.memory_bytes <= max.memory_bytes
            }
        }
    }

    /// Clamp a capacity into these bounds.
    ///
    /// Returns `None` when the capacity kind does not match the bounds.
    pub fn clamp(&self, capacity: &Capacity) -> Option<Clamped> {
        match (self, capacity) {
            (CapacityBounds::Count { min, max }, Capacity::Count(n)) => {
                let (value, reason) = if n > max {
                    (*max, Some(ReasonCode::ClampedToMax))
                } else if n < min {
                    (*min, Some(ReasonCode::ClampedToMin))
                } else {
                    (*n, None)
                };
                Some(Clamped {
                    capacity: Capacity::Count(value),
                    reason,
                })
            }
            (CapacityBounds::Resources { min, max }, Capacity::Resources(req)) => {
                let clamped = ResourceRequirements {
                    requests: req.requests.clamp(*min, *max),
                    limits: req.limits.clamp(*min, *max),
                };
                let reason = if clamped == *req {
                    None
                } else if exceeds(&req.requests, max) || exceeds(&req.limits, max) {
                    Some(ReasonCode::ClampedToMax)
                } else {
                    Some(ReasonCode::ClampedToMin)
                };
                Some(Clamped {
                    capacity: Capacity::Resources(clamped),
                    reason,
                })
            }
            _ => None,
        }
    }

    /// Whether a capacity lies within these bounds.
    pub fn contains(&self, capacity: &Capacity) -> bool {
        match (self, capacity) {
            (CapacityBounds::Count { min, max }, Capacity::Count(n)) => (*min..=*max).contains(n),
            (CapacityBounds::Resources { min, max }, Capacity::Resources(req)) => {
                req.requests.within(min, max) && req.limits.within(min, max)
            }
            _ => false,
        }
    }
}

fn exceeds(r: &Resources, max: &Resources) -> bool {
    r.cpu_millis > max.cpu_millis || r.memory_bytes > max.memory_bytes
}

/// A group or workload managed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalableTarget {
    pub id: TargetId,
    pub kind: TargetKind,
    pub capacity: Capacity,
    pub bounds: CapacityBounds,
    /// When the last scaling action was applied.
    pub last_scale_at: Option<Timestamp>,
}

/// Scaling state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPhase {
    Stable,
    Cooling { remaining: Duration },
}

impl ScalableTarget {
    /// A horizontally scaled group with `capacity` units.
    pub fn horizontal(id: &str, capacity: u32, min: u32, max: u32) -> Self {
        Self {
            id: id.to_string(),
            kind: TargetKind::HorizontalGroup,
            capacity: Capacity::Count(capacity),
            bounds: CapacityBounds::Count { min, max },
            last_scale_at: None,
        }
    }

    /// A vertically scaled workload.
    pub fn vertical(
        id: &str,
        current: ResourceRequirements,
        min: Resources,
        max: Resources,
    ) -> Self {
        Self {
            id: id.to_string(),
            kind: TargetKind::VerticalPod,
            capacity: Capacity::Resources(current),
            bounds: CapacityBounds::Resources { min, max },
            last_scale_at: None,
        }
    }

    /// Time left before another action may be applied, if any.
    pub fn cooldown_remaining(&self, cooldown: Duration, now: Timestamp) -> Option<Duration> {
        let last = self.last_scale_at?;
        let elapsed = now.saturating_sub(last);
        let cooldown_ms = duration_millis(cooldown);
        (elapsed < cooldown_ms).then(|| Duration::from_millis(cooldown_ms - elapsed))
    }

    pub fn phase(&self, cooldown: Duration, now: Timestamp) -> TargetPhase {
        match self.cooldown_remaining(cooldown, now) {
            Some(remaining) => TargetPhase::Cooling { remaining },
            None => TargetPhase::Stable,
        }
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// A single utilization observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub target_id: TargetId,
    pub metric: String,
    pub value: f64,
    pub timestamp: Timestamp,
}

/// How samples in a window are reduced to one statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    Max,
    Min,
    P50,
    P90,
    P95,
    P99,
}

impl Aggregation {
    /// Percentile rank for the percentile variants.
    pub fn percentile(&self) -> Option<f64> {
        match self {
            Aggregation::P50 => Some(50.0),
            Aggregation::P90 => Some(90.0),
            Aggregation::P95 => Some(95.0),
            Aggregation::P99 => Some(99.0),
            _ => None,
        }
    }
}

// ── Decisions ─────────────────────────────────────────────────────

/// Why a decision or action was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    ScaleUp,
    ScaleDown,
    StepUp,
    StepDown,
    WithinDeadBand,
    InsufficientData,
    VerticalGrow,
    VerticalShrink,
    VerticalHold,
    ScaleDownSuppressed,
    ClampedToMin,
    ClampedToMax,
    CooldownActive,
    Unchanged,
    KindMismatch,
    EffectorFailure,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ScaleUp => "scale-up",
            ReasonCode::ScaleDown => "scale-down",
            ReasonCode::StepUp => "step-up",
            ReasonCode::StepDown => "step-down",
            ReasonCode::WithinDeadBand => "within-dead-band",
            ReasonCode::InsufficientData => "insufficient-data",
            ReasonCode::VerticalGrow => "vertical-grow",
            ReasonCode::VerticalShrink => "vertical-shrink",
            ReasonCode::VerticalHold => "vertical-hold",
            ReasonCode::ScaleDownSuppressed => "scale-down-suppressed",
            ReasonCode::ClampedToMin => "clamped-to-min",
            ReasonCode::ClampedToMax => "clamped-to-max",
            ReasonCode::CooldownActive => "cooldown-active",
            ReasonCode::Unchanged => "unchanged",
            ReasonCode::KindMismatch => "kind-mismatch",
            ReasonCode::EffectorFailure => "effector-failure",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one policy evaluation. Transient: produced and consumed
/// within a single evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub target_id: TargetId,
    /// Capacity at evaluation time.
    pub current: Capacity,
    /// Proposed capacity. `None` means no-op.
    pub proposed: Option<Capacity>,
    pub reason: ReasonCode,
    /// The statistic the decision was based on, when scalar.
    pub statistic: Option<f64>,
    pub timestamp: Timestamp,
}

impl ScalingDecision {
    pub fn noop(
        target: &ScalableTarget,
        reason: ReasonCode,
        statistic: Option<f64>,
        now: Timestamp,
    ) -> Self {
        Self {
            target_id: target.id.clone(),
            current: target.capacity,
            proposed: None,
            reason,
            statistic,
            timestamp: now,
        }
    }

    pub fn propose(
        target: &ScalableTarget,
        proposed: Capacity,
        reason: ReasonCode,
        statistic: Option<f64>,
        now: Timestamp,
    ) -> Self {
        Self {
            target_id: target.id.clone(),
            current: target.capacity,
            proposed: Some(proposed),
            reason,
            statistic,
            timestamp: now,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.proposed.is_none()
    }
}

/// A bounded action that passed reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAction {
    pub target_id: TargetId,
    pub old: Capacity,
    pub new: Capacity,
    pub reason: ReasonCode,
    pub timestamp: Timestamp,
}

// ── Audit ─────────────────────────────────────────────────────────

/// What an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// The evaluator produced a decision.
    Decision,
    /// The reconciler accepted the decision and the effector applied it.
    Applied,
    /// The reconciler rejected the decision.
    Rejected,
    /// The effector call failed or timed out.
    Failed,
}

/// Structured record emitted for every decision and action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub target_id: TargetId,
    pub event: AuditEvent,
    pub old: Option<Capacity>,
    pub new: Option<Capacity>,
    pub reason: ReasonCode,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn decision(decision: &ScalingDecision) -> Self {
        Self {
            target_id: decision.target_id.clone(),
            event: AuditEvent::Decision,
            old: Some(decision.current),
            new: decision.proposed,
            reason: decision.reason,
            timestamp: decision.timestamp,
            detail: decision.statistic.map(|s| format!("statistic={s}")),
        }
    }

    pub fn applied(action: &AppliedAction) -> Self {
        Self {
            target_id: action.target_id.clone(),
            event: AuditEvent::Applied,
            old: Some(action.old),
            new: Some(action.new),
            reason: action.reason,
            timestamp: action.timestamp,
            detail: None,
        }
    }
}
