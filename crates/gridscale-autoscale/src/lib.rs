//! gridscale-autoscale — metrics-driven horizontal and vertical scaling.
//!
//! Turns windowed metric statistics into bounded, cooldown-respecting
//! capacity changes and hands them to a pluggable [`Effector`].
//!
//! # Scaling Algorithm
//!
//! ```text
//! statistic = aggregate(samples in [now - window, now])
//!
//! target tracking:
//!     |statistic - target| <= target * dead_band   → hold
//!     statistic > up_target * (1 + dead_band)      → ceil(capacity * statistic / up_target)
//!     statistic < down_target * (1 - dead_band)    → ceil(capacity * statistic / down_target)
//!
//! step:
//!     breach = statistic - target; add or remove the matching step's units
//!
//! vertical:
//!     request = percentile(usage) * headroom
//!     grow immediately, shrink only after a full window of history
//! ```
//!
//! Every proposal is clamped to `[min, max]` and applied at most once per
//! cooldown. Without samples in the window a target is skipped, never
//! scaled down.

pub mod effector;
pub mod engine;
pub mod evaluator;
pub mod reconciler;

pub use effector::{ApplyFuture, Effector, LogEffector};
pub use engine::{Engine, ManagedTarget, TargetOutcome, TickReport};
pub use evaluator::{evaluate, Observation};
pub use reconciler::{reconcile, revert, Rejected};
