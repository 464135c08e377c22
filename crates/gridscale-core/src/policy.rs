//! Scaling policies and their registration-time validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ScaleError, ScaleResult};
use crate::types::{Aggregation, ScalableTarget, TargetId, TargetKind};

/// Default dead-band around the target value, in percent.
pub const DEFAULT_DEAD_BAND_PERCENT: f64 = 10.0;

/// Default cooldown between two actions on the same target.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Default evaluation window for horizontal policies.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// One band of a step policy.
///
/// Bounds are relative to the breached threshold: a breach of
/// `statistic - threshold` (scale-up) or `threshold - statistic`
/// (scale-down) selects the first step with
/// `lower_bound <= breach < upper_bound`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAdjustment {
    pub lower_bound: f64,
    #[serde(default)]
    pub upper_bound: Option<f64>,
    /// Units added (scale-up) or removed (scale-down).
    pub adjustment: u32,
}

impl StepAdjustment {
    pub fn contains(&self, breach: f64) -> bool {
        breach >= self.lower_bound && self.upper_bound.is_none_or(|upper| breach < upper)
    }
}

/// Tunables for vertical recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerticalSettings {
    /// Metric carrying CPU usage in millicores.
    pub cpu_metric: String,
    /// Metric carrying memory usage in bytes.
    pub memory_metric: String,
    /// Usage percentile the request is derived from.
    pub percentile: f64,
    /// Multiplicative headroom applied to the percentile.
    pub headroom: f64,
    /// limit = request * ratio.
    pub limit_to_request_ratio: f64,
}

impl Default for VerticalSettings {
    fn default() -> Self {
        Self {
            cpu_metric: "cpu_millis".to_string(),
            memory_metric: "memory_bytes".to_string(),
            percentile: 95.0,
            headroom: 1.2,
            limit_to_request_ratio: 1.5,
        }
    }
}

/// Which algorithm a policy uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyKind {
    /// Proportional count adjustment towards a target value.
    TargetTracking,
    /// Fixed increments chosen by how far a threshold is breached.
    Step { steps: Vec<StepAdjustment> },
    /// Request/limit recommendation from usage history.
    VerticalRecommendation(VerticalSettings),
}

impl PolicyKind {
    /// Target kind this policy can drive.
    pub fn target_kind(&self) -> TargetKind {
        match self {
            PolicyKind::TargetTracking | PolicyKind::Step { .. } => TargetKind::HorizontalGroup,
            PolicyKind::VerticalRecommendation(_) => TargetKind::VerticalPod,
        }
    }
}

/// A scaling policy bound to one target.
///
/// Immutable after registration; updates replace the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub target_id: TargetId,
    /// Metric evaluated by horizontal policies.
    pub metric: String,
    pub kind: PolicyKind,
    pub target_value: f64,
    /// Target used when scaling up. Falls back to `target_value`.
    pub scale_up_target: Option<f64>,
    /// Target used when scaling down. Falls back to `target_value`.
    pub scale_down_target: Option<f64>,
    pub dead_band_percent: f64,
    pub cooldown: Duration,
    /// Span of samples the statistic is computed over.
    pub window: Duration,
    pub aggregation: Aggregation,
}

impl ScalingPolicy {
    /// A target-tracking policy with default tunables.
    pub fn target_tracking(target_id: &str, metric: &str, target_value: f64) -> Self {
        Self {
            target_id: target_id.to_string(),
            metric: metric.to_string(),
            kind: PolicyKind::TargetTracking,
            target_value,
            scale_up_target: None,
            scale_down_target: None,
            dead_band_percent: DEFAULT_DEAD_BAND_PERCENT,
            cooldown: DEFAULT_COOLDOWN,
            window: DEFAULT_WINDOW,
            aggregation: Aggregation::Mean,
        }
    }

    /// A step policy around `target_value`.
    pub fn step(
        target_id: &str,
        metric: &str,
        target_value: f64,
        steps: Vec<StepAdjustment>,
    ) -> Self {
        Self {
            kind: PolicyKind::Step { steps },
            ..Self::target_tracking(target_id, metric, target_value)
        }
    }

    /// A vertical recommendation policy over `window` of history.
    pub fn vertical(target_id: &str, settings: VerticalSettings, window: Duration) -> Self {
        Self {
            target_id: target_id.to_string(),
            metric: settings.cpu_metric.clone(),
            target_value: 1.0,
            scale_up_target: None,
            scale_down_target: None,
            dead_band_percent: 0.0,
            cooldown: DEFAULT_COOLDOWN,
            window,
            aggregation: Aggregation::P95,
            kind: PolicyKind::VerticalRecommendation(settings),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_dead_band(mut self, percent: f64) -> Self {
        self.dead_band_percent = percent;
        self
    }

    pub fn with_scale_targets(mut self, up: Option<f64>, down: Option<f64>) -> Self {
        self.scale_up_target = up;
        self.scale_down_target = down;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn up_target(&self) -> f64 {
        self.scale_up_target.unwrap_or(self.target_value)
    }

    pub fn down_target(&self) -> f64 {
        self.scale_down_target.unwrap_or(self.target_value)
    }

    /// Dead-band as a fraction (10% → 0.1).
    pub fn dead_band(&self) -> f64 {
        self.dead_band_percent / 100.0
    }

    /// Metric series this policy reads.
    pub fn metrics(&self) -> Vec<&str> {
        match &self.kind {
            PolicyKind::VerticalRecommendation(v) => {
                vec![v.cpu_metric.as_str(), v.memory_metric.as_str()]
            }
            _ => vec![self.metric.as_str()],
        }
    }

    /// Check the policy is well-formed and can drive `target`.
    pub fn validate(&self, target: &ScalableTarget) -> ScaleResult<()> {
        let id = &self.target_id;
        let fail = |reason: String| Err(ScaleError::invalid_policy(id, reason));

        if *id != target.id {
            return fail(format!("policy is bound to {id} but target is {}", target.id));
        }
        if target.kind != target.capacity.kind() || target.kind != target.bounds.kind() {
            return fail("target capacity and bounds disagree on kind".to_string());
        }
        if !target.bounds.is_ordered() {
            return fail("min capacity exceeds max capacity".to_string());
        }
        if self.kind.target_kind() != target.kind {
            return fail(format!(
                "{:?} policy cannot drive a {:?} target",
                self.kind.target_kind(),
                target.kind
            ));
        }
        if self.window.is_zero() {
            return fail("window must be non-zero".to_string());
        }

        match &self.kind {
            PolicyKind::TargetTracking | PolicyKind::Step { .. } => {
                if self.metric.is_empty() {
                    return fail("metric name is empty".to_string());
                }
                if !positive(self.target_value) {
                    return fail(format!("target_value must be > 0, got {}", self.target_value));
                }
                let overrides = [
                    ("scale_up_target", self.scale_up_target),
                    ("scale_down_target", self.scale_down_target),
                ];
                for (name, value) in overrides {
                    if let Some(v) = value
                        && !positive(v)
                    {
                        return fail(format!("{name} must be > 0, got {v}"));
                    }
                }
                if !(0.0..100.0).contains(&self.dead_band_percent) {
                    return fail(format!(
                        "dead_band_percent must be in [0, 100), got {}",
                        self.dead_band_percent
                    ));
                }
            }
            PolicyKind::VerticalRecommendation(_) => {}
        }

        match &self.kind {
            PolicyKind::TargetTracking => Ok(()),
            PolicyKind::Step { steps } => {
                if steps.is_empty() {
                    return fail("step policy needs at least one step".to_string());
                }
                for step in steps {
                    let inverted = step.upper_bound.is_some_and(|u| !(u > step.lower_bound));
                    if !(step.lower_bound >= 0.0) || inverted {
                        return fail(format!("malformed step bounds {step:?}"));
                    }
                    if step.adjustment == 0 {
                        return fail("step adjustment must be > 0".to_string());
                    }
                }
                Ok(())
            }
            PolicyKind::VerticalRecommendation(v) => {
                if v.cpu_metric.is_empty() || v.memory_metric.is_empty() {
                    return fail("vertical metrics must be named".to_string());
                }
                if !(v.percentile > 0.0 && v.percentile <= 100.0) {
                    return fail(format!("percentile must be in (0, 100], got {}", v.percentile));
                }
                if !positive(v.headroom) {
                    return fail(format!("headroom must be > 0, got {}", v.headroom));
                }
                if !(v.limit_to_request_ratio.is_finite() && v.limit_to_request_ratio >= 1.0) {
                    return fail(format!(
                        "limit_to_request_ratio must be >= 1, got {}",
                        v.limit_to_request_ratio
                    ));
                }
                Ok(())
            }
        }
    }
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}
