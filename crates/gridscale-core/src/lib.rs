//! gridscale-core — shared types for the gridscale autoscaling engine.
//!
//! Defines scalable targets, metric samples, scaling policies, decisions
//! and audit records, plus the `gridscale.toml` parser that turns a
//! target-id → policy mapping into validated registrations.

pub mod config;
pub mod error;
pub mod policy;
pub mod quantity;
pub mod types;

pub use config::{EngineSettings, GridscaleConfig};
pub use error::{ScaleError, ScaleResult};
pub use policy::{PolicyKind, ScalingPolicy, StepAdjustment, VerticalSettings};
pub use types::*;
