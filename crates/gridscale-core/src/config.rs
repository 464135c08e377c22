//! gridscale.toml configuration parser.
//!
//! The file maps target ids to their capacity, bounds and policy:
//!
//! ```toml
//! [engine]
//! interval = "30s"
//! max_concurrency = 8
//!
//! [targets.web]
//! capacity = 2
//! min_capacity = 1
//! max_capacity = 5
//!
//! [targets.web.policy]
//! type = "target_tracking"
//! metric = "cpu"
//! target_value = 50
//! scale_down_target = 30
//! cooldown = "300s"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ScaleError, ScaleResult};
use crate::policy::{
    PolicyKind, ScalingPolicy, StepAdjustment, VerticalSettings, DEFAULT_COOLDOWN,
    DEFAULT_DEAD_BAND_PERCENT, DEFAULT_WINDOW,
};
use crate::quantity::{parse_cpu, parse_duration, parse_memory};
use crate::types::{Aggregation, ResourceRequirements, Resources, ScalableTarget, TargetKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridscaleConfig {
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub interval: Option<String>,
    pub max_concurrency: Option<usize>,
    pub effector_timeout: Option<String>,
    pub default_retention: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub kind: Option<TargetKind>,
    pub capacity: Option<u32>,
    pub min_capacity: Option<u32>,
    pub max_capacity: Option<u32>,
    pub resources: Option<ResourcesConfig>,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub min_cpu: Option<String>,
    pub min_memory: Option<String>,
    pub max_cpu: Option<String>,
    pub max_memory: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub metric: Option<String>,
    pub target_value: Option<f64>,
    pub scale_up_target: Option<f64>,
    pub scale_down_target: Option<f64>,
    pub dead_band_percent: Option<f64>,
    pub cooldown: Option<String>,
    pub window: Option<String>,
    pub aggregation: Option<Aggregation>,
    pub steps: Option<Vec<StepAdjustment>>,
    pub cpu_metric: Option<String>,
    pub memory_metric: Option<String>,
    pub percentile: Option<f64>,
    pub headroom: Option<f64>,
    pub limit_to_request_ratio: Option<f64>,
}

/// Resolved engine tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Control-loop tick interval.
    pub interval: Duration,
    /// Maximum number of targets evaluated concurrently.
    pub max_concurrency: usize,
    /// Deadline for a single effector call.
    pub effector_timeout: Duration,
    /// Sample retention for targets without a registered policy.
    pub default_retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_concurrency: 8,
            effector_timeout: Duration::from_secs(10),
            default_retention: Duration::from_secs(3600),
        }
    }
}

impl GridscaleConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: GridscaleConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve the `[engine]` section, filling in defaults.
    /// Zero durations are refused.
    pub fn engine_settings(&self) -> ScaleResult<EngineSettings> {
        let defaults = EngineSettings::default();
        let Some(engine) = &self.engine else {
            return Ok(defaults);
        };
        Ok(EngineSettings {
            interval: non_zero_duration(&engine.interval, defaults.interval)?,
            max_concurrency: engine
                .max_concurrency
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            effector_timeout: non_zero_duration(
                &engine.effector_timeout,
                defaults.effector_timeout,
            )?,
            default_retention: non_zero_duration(
                &engine.default_retention,
                defaults.default_retention,
            )?,
        })
    }

    /// Convert every target entry into a validated registration.
    ///
    /// Entries are converted independently so one malformed target does
    /// not keep the others from being managed.
    pub fn registrations(&self) -> Vec<(String, ScaleResult<(ScalableTarget, ScalingPolicy)>)> {
        self.targets
            .iter()
            .map(|(id, target)| (id.clone(), target.resolve(id)))
            .collect()
    }
}

impl TargetConfig {
    /// Build the target and its policy.
    pub fn resolve(&self, id: &str) -> ScaleResult<(ScalableTarget, ScalingPolicy)> {
        let kind = self.kind.unwrap_or(TargetKind::HorizontalGroup);
        let target = match kind {
            TargetKind::HorizontalGroup => {
                let min = self.min_capacity.unwrap_or(1);
                let max = self
                    .max_capacity
                    .ok_or_else(|| ScaleError::invalid_policy(id, "max_capacity is required"))?;
                let capacity = self.capacity.unwrap_or(min);
                ScalableTarget::horizontal(id, capacity, min, max)
            }
            TargetKind::VerticalPod => {
                let resources = self.resources.as_ref().ok_or_else(|| {
                    ScaleError::invalid_policy(id, "vertical target needs [resources]")
                })?;
                resources.resolve(id, self.policy.limit_to_request_ratio)?
            }
        };

        let policy = self.policy.resolve(id, kind)?;
        policy.validate(&target)?;
        Ok((target, policy))
    }
}

impl ResourcesConfig {
    fn resolve(&self, id: &str, ratio: Option<f64>) -> ScaleResult<ScalableTarget> {
        let requests = Resources::new(
            parse_cpu(required(id, &self.cpu_request, "cpu_request")?)?,
            parse_memory(required(id, &self.memory_request, "memory_request")?)?,
        );
        let ratio = ratio.unwrap_or(VerticalSettings::default().limit_to_request_ratio);
        let limits = Resources::new(
            optional(&self.cpu_limit, parse_cpu, scale(requests.cpu_millis, ratio))?,
            optional(&self.memory_limit, parse_memory, scale(requests.memory_bytes, ratio))?,
        );
        let min = Resources::new(
            optional(&self.min_cpu, parse_cpu, 0)?,
            optional(&self.min_memory, parse_memory, 0)?,
        );
        let max = Resources::new(
            parse_cpu(required(id, &self.max_cpu, "max_cpu")?)?,
            parse_memory(required(id, &self.max_memory, "max_memory")?)?,
        );

        Ok(ScalableTarget::vertical(
            id,
            ResourceRequirements { requests, limits },
            min,
            max,
        ))
    }
}

impl PolicyConfig {
    fn resolve(&self, id: &str, target_kind: TargetKind) -> ScaleResult<ScalingPolicy> {
        let cooldown = self.cooldown.as_deref().map(parse_duration).transpose()?;
        let window = self.window.as_deref().map(parse_duration).transpose()?;

        let kind = match self.kind.as_deref() {
            Some(kind) => kind,
            None if target_kind == TargetKind::VerticalPod => "vertical_recommendation",
            None => "target_tracking",
        };

        let policy = match kind {
            "vertical_recommendation" => {
                let defaults = VerticalSettings::default();
                let settings = VerticalSettings {
                    cpu_metric: self.cpu_metric.clone().unwrap_or(defaults.cpu_metric),
                    memory_metric: self.memory_metric.clone().unwrap_or(defaults.memory_metric),
                    percentile: self.percentile.unwrap_or(defaults.percentile),
                    headroom: self.headroom.unwrap_or(defaults.headroom),
                    limit_to_request_ratio: self
                        .limit_to_request_ratio
                        .unwrap_or(defaults.limit_to_request_ratio),
                };
                let window = window.unwrap_or(Duration::from_secs(8 * 3600));
                ScalingPolicy::vertical(id, settings, window)
            }
            "target_tracking" | "step" => {
                let metric = self
                    .metric
                    .as_deref()
                    .ok_or_else(|| ScaleError::invalid_policy(id, "policy.metric is required"))?;
                let target_value = self.target_value.ok_or_else(|| {
                    ScaleError::invalid_policy(id, "policy.target_value is required")
                })?;
                let base = ScalingPolicy::target_tracking(id, metric, target_value)
                    .with_scale_targets(self.scale_up_target, self.scale_down_target)
                    .with_dead_band(self.dead_band_percent.unwrap_or(DEFAULT_DEAD_BAND_PERCENT))
                    .with_window(window.unwrap_or(DEFAULT_WINDOW));
                if kind == "step" {
                    ScalingPolicy {
                        kind: PolicyKind::Step {
                            steps: self.steps.clone().unwrap_or_else(|| {
                                vec![StepAdjustment {
                                    lower_bound: 0.0,
                                    upper_bound: None,
                                    adjustment: 1,
                                }]
                            }),
                        },
                        ..base
                    }
                } else {
                    base
                }
            }
            other => {
                return Err(ScaleError::invalid_policy(
                    id,
                    format!("unknown policy type {other:?}"),
                ));
            }
        };

        let policy = match self.aggregation {
            Some(aggregation) => policy.with_aggregation(aggregation),
            None => policy,
        };
        Ok(policy.with_cooldown(cooldown.unwrap_or(DEFAULT_COOLDOWN)))
    }
}

fn required<'a>(id: &str, value: &'a Option<String>, name: &str) -> ScaleResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| ScaleError::invalid_policy(id, format!("resources.{name} is required")))
}

fn optional(
    value: &Option<String>,
    parse: fn(&str) -> ScaleResult<u64>,
    fallback: u64,
) -> ScaleResult<u64> {
    match value {
        Some(s) => parse(s),
        None => Ok(fallback),
    }
}

fn non_zero_duration(value: &Option<String>, fallback: Duration) -> ScaleResult<Duration> {
    let Some(s) = value else {
        return Ok(fallback);
    };
    let parsed = parse_duration(s)?;
    if parsed.is_zero() {
        return Err(ScaleError::InvalidQuantity(s.clone()));
    }
    Ok(parsed)
}

fn scale(value: u64, ratio: f64) -> u64 {
    (value as f64 * ratio).ceil() as u64
}
