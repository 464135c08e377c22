//! gridscale-metrics — utilization sample windows for the gridscale engine.
//!
//! Keeps a rolling, strictly time-ordered window per (target, metric)
//! series and answers windowed statistics (mean, max, percentiles) for the
//! policy evaluator.
//!
//! # Architecture
//!
//! ```text
//! MetricsAggregator
//!   ├── record()             ← push ingestion (rejects out-of-order samples)
//!   ├── windowed_statistic() → horizontal policies
//!   └── usage_profile()      → vertical recommendations
//!
//! MetricsPoller
//!   └── run() → pulls MetricSource::fetch() into the aggregator
//! ```
//!
//! Samples older than a target's retention (the largest window of its
//! policies) are purged lazily on the next write.

pub mod aggregator;
pub mod source;
pub mod window;

pub use aggregator::{MetricsAggregator, UsageProfile};
pub use source::{FetchFuture, MetricSource, MetricsPoller, PollReport};
pub use window::MetricWindow;
