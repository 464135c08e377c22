//! Error types shared by the gridscale crates.

use std::time::Duration;

use thiserror::Error;

use crate::types::{TargetId, Timestamp};

/// Result type alias for engine operations.
pub type ScaleResult<T> = Result<T, ScaleError>;

/// Errors that can occur while ingesting metrics, registering policies,
/// or applying scaling actions.
///
/// None of these are fatal to the host process: every variant is local
/// to a single target and recoverable on the next control-loop tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScaleError {
    #[error("invalid sample for {target_id}/{metric}: {reason}")]
    InvalidSample {
        target_id: TargetId,
        metric: String,
        reason: String,
    },

    #[error("no data for {target_id}/{metric} in the last {window:?}")]
    NoData {
        target_id: TargetId,
        metric: String,
        window: Duration,
    },

    #[error("invalid policy for {target_id}: {reason}")]
    InvalidPolicy { target_id: TargetId, reason: String },

    #[error("cooldown active for {target_id}: {remaining:?} remaining")]
    CooldownActive {
        target_id: TargetId,
        remaining: Duration,
    },

    #[error("effector failed for {target_id}: {message}")]
    EffectorFailure { target_id: TargetId, message: String },

    #[error("unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error("target already registered: {0}")]
    AlreadyRegistered(TargetId),

    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),
}

impl ScaleError {
    /// Build an `InvalidSample` error for an out-of-order timestamp.
    pub fn stale_sample(
        target_id: &str,
        metric: &str,
        timestamp: Timestamp,
        newest: Timestamp,
    ) -> Self {
        ScaleError::InvalidSample {
            target_id: target_id.to_string(),
            metric: metric.to_string(),
            reason: format!("timestamp {timestamp} is not after newest sample {newest}"),
        }
    }

    /// Build an `InvalidPolicy` error.
    pub fn invalid_policy(target_id: &str, reason: impl Into<String>) -> Self {
        ScaleError::InvalidPolicy {
            target_id: target_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is expected during normal operation and should
    /// not be surfaced above debug level.
    pub fn is_informational(&self) -> bool {
        matches!(self, ScaleError::NoData { .. } | ScaleError::CooldownActive { .. })
    }
}
