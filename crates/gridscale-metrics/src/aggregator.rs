//! Metrics aggregator — per-target rolling windows of utilization samples.
//!
//! State is partitioned by target id: a short-lived map lock finds the
//! target's series, and a per-target mutex serializes writes against
//! evaluation reads for that target only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use gridscale_core::{
    duration_millis, Aggregation, MetricSample, ScaleError, ScaleResult, TargetId, Timestamp,
};

use crate::window::{aggregate, longest_gap, percentile, MetricWindow};

/// Usage summary consumed by vertical recommendations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageProfile {
    /// Requested percentile of samples in the window.
    pub percentile: f64,
    /// Largest sample in the window.
    pub max: f64,
    /// Number of samples in the window.
    pub samples: usize,
    /// When the series first received data.
    pub first_seen: Timestamp,
    /// Longest stretch of the window, in milliseconds, with no sample.
    pub longest_gap: u64,
}

/// All series of one target.
#[derive(Debug)]
struct TargetSeries {
    /// Samples older than `newest - retention` are purged on write.
    retention: Duration,
    windows: HashMap<String, MetricWindow>,
}

impl TargetSeries {
    fn new(retention: Duration) -> Self {
        Self {
            retention,
            windows: HashMap::new(),
        }
    }
}

/// Ingests samples and answers windowed statistics.
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct MetricsAggregator {
    targets: Arc<RwLock<HashMap<TargetId, Arc<Mutex<TargetSeries>>>>>,
    default_retention: Duration,
}

impl MetricsAggregator {
    /// Create an aggregator. Targets without an explicit retention keep
    /// `default_retention` worth of samples.
    pub fn new(default_retention: Duration) -> Self {
        Self {
            targets: Arc::new(RwLock::new(HashMap::new())),
            default_retention,
        }
    }

    /// Set how much history a target keeps (the largest policy window).
    pub async fn set_retention(&self, target_id: &str, retention: Duration) {
        let series = self.series_or_insert(target_id).await;
        series.lock().await.retention = retention;
        debug!(%target_id, retention_secs = retention.as_secs(), "retention updated");
    }

    /// Forget every series of a target.
    pub async fn remove_target(&self, target_id: &str) {
        self.targets.write().await.remove(target_id);
        debug!(%target_id, "metrics removed");
    }

    /// Append a sample.
    ///
    /// Fails with `InvalidSample` when the timestamp is not newer than the
    /// newest sample of the same series, or when the value is not finite.
    pub async fn record(
        &self,
        target_id: &str,
        metric: &str,
        value: f64,
        timestamp: Timestamp,
    ) -> ScaleResult<()> {
        if !value.is_finite() {
            return Err(ScaleError::InvalidSample {
                target_id: target_id.to_string(),
                metric: metric.to_string(),
                reason: format!("value {value} is not finite"),
            });
        }

        let series = self.series_or_insert(target_id).await;
        let mut series = series.lock().await;
        let cutoff = timestamp.saturating_sub(duration_millis(series.retention));

        series
            .windows
            .entry(metric.to_string())
            .or_default()
            .push(timestamp, value)
            .map_err(|newest| ScaleError::stale_sample(target_id, metric, timestamp, newest))?;
        // Sibling series are purged too, so a metric that stopped
        // reporting does not hold its samples forever.
        let evicted: usize = series
            .windows
            .values_mut()
            .map(|w| w.evict_before(cutoff))
            .sum();

        debug!(%target_id, %metric, value, timestamp, evicted, "sample recorded");
        Ok(())
    }

    /// Append a sample for a target the aggregator already tracks.
    ///
    /// Fails with `UnknownTarget` instead of creating a new series, so
    /// untrusted input cannot grow the target map.
    pub async fn record_tracked(&self, sample: &MetricSample) -> ScaleResult<()> {
        if self.series(&sample.target_id).await.is_none() {
            return Err(ScaleError::UnknownTarget(sample.target_id.clone()));
        }
        self.record_sample(sample).await
    }

    /// Append a sample from its owned form.
    pub async fn record_sample(&self, sample: &MetricSample) -> ScaleResult<()> {
        self.record(&sample.target_id, &sample.metric, sample.value, sample.timestamp)
            .await
    }

    /// Aggregate samples with timestamps in `[now - window, now]`.
    ///
    /// Returns `NoData` when the window holds no samples; callers skip the
    /// evaluation rather than treating it as zero.
    pub async fn windowed_statistic(
        &self,
        target_id: &str,
        metric: &str,
        window: Duration,
        aggregation: Aggregation,
        now: Timestamp,
    ) -> ScaleResult<f64> {
        let values = self.values_in_window(target_id, metric, window, now).await;
        aggregate(&values, aggregation).ok_or_else(|| no_data(target_id, metric, window))
    }

    /// Percentile, maximum and history depth of a series over `window`.
    pub async fn usage_profile(
        &self,
        target_id: &str,
        metric: &str,
        window: Duration,
        q: f64,
        now: Timestamp,
    ) -> ScaleResult<UsageProfile> {
        let Some(series) = self.series(target_id).await else {
            return Err(no_data(target_id, metric, window));
        };
        let series = series.lock().await;
        let Some(w) = series.windows.get(metric) else {
            return Err(no_data(target_id, metric, window));
        };

        let from = now.saturating_sub(duration_millis(window));
        let (stamps, values): (Vec<Timestamp>, Vec<f64>) = w.points_between(from, now).unzip();
        match (
            percentile(&values, q),
            aggregate(&values, Aggregation::Max),
            w.first_seen(),
        ) {
            (Some(p), Some(max), Some(first_seen)) => Ok(UsageProfile {
                percentile: p,
                max,
                samples: values.len(),
                first_seen,
                longest_gap: longest_gap(&stamps, from, now),
            }),
            _ => Err(no_data(target_id, metric, window)),
        }
    }

    /// Timestamp of the newest sample of a series.
    pub async fn newest(&self, target_id: &str, metric: &str) -> Option<Timestamp> {
        let series = self.series(target_id).await?;
        let series = series.lock().await;
        series.windows.get(metric).and_then(MetricWindow::newest)
    }

    /// Samples recorded after `since`, oldest first.
    pub async fn samples(
        &self,
        target_id: &str,
        metric: &str,
        since: Timestamp,
    ) -> Vec<MetricSample> {
        let Some(series) = self.series(target_id).await else {
            return Vec::new();
        };
        let series = series.lock().await;
        series
            .windows
            .get(metric)
            .map(|w| {
                w.since(since)
                    .map(|(timestamp, value)| MetricSample {
                        target_id: target_id.to_string(),
                        metric: metric.to_string(),
                        value,
                        timestamp,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of retained samples across all series of a target.
    pub async fn retained_samples(&self, target_id: &str) -> usize {
        match self.series(target_id).await {
            Some(series) => series.lock().await.windows.values().map(MetricWindow::len).sum(),
            None => 0,
        }
    }

    /// Target ids known to the aggregator.
    pub async fn tracked_targets(&self) -> Vec<TargetId> {
        self.targets.read().await.keys().cloned().collect()
    }

    async fn values_in_window(
        &self,
        target_id: &str,
        metric: &str,
        window: Duration,
        now: Timestamp,
    ) -> Vec<f64> {
        let Some(series) = self.series(target_id).await else {
            return Vec::new();
        };
        let series = series.lock().await;
        series
            .windows
            .get(metric)
            .map(|w| w.values_between(now.saturating_sub(duration_millis(window)), now))
            .unwrap_or_default()
    }

    async fn series(&self, target_id: &str) -> Option<Arc<Mutex<TargetSeries>>> {
        self.targets.read().await.get(target_id).cloned()
    }

    async fn series_or_insert(&self, target_id: &str) -> Arc<Mutex<TargetSeries>> {
        if let Some(series) = self.series(target_id).await {
            return series;
        }
        let mut targets = self.targets.write().await;
        targets
            .entry(target_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TargetSeries::new(self.default_retention))))
            .clone()
    }
}

fn no_data(target_id: &str, metric: &str, window: Duration) -> ScaleError {
    ScaleError::NoData {
        target_id: target_id.to_string(),
        metric: metric.to_string(),
        window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> MetricsAggregator {
        MetricsAggregator::new(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn record_and_average() {
        let agg = aggregator();
        for (i, v) in [40.0, 60.0, 80.0].iter().enumerate() {
            agg.record("web", "cpu", *v, 1_000 + i as u64 * 1_000).await.unwrap();
        }

        let mean = agg
            .windowed_statistic("web", "cpu", Duration::from_secs(60), Aggregation::Mean, 3_000)
            .await
            .unwrap();
        assert_eq!(mean, 60.0);

        let max = agg
            .windowed_statistic("web", "cpu", Duration::from_secs(60), Aggregation::Max, 3_000)
            .await
            .unwrap();
        assert_eq!(max, 80.0);
    }

    #[tokio::test]
    async fn out_of_order_sample_rejected() {
        let agg = aggregator();
        agg.record("web", "cpu", 50.0, 2_000).await.unwrap();

        let err = agg.record("web", "cpu", 55.0, 1_000).await.unwrap_err();
        assert!(matches!(err, ScaleError::InvalidSample { .. }));

        // Other series of the same target are unaffected.
        agg.record("web", "memory", 10.0, 1_000).await.unwrap();
    }

    #[tokio::test]
    async fn non_finite_value_rejected() {
        let agg = aggregator();
        let err = agg.record("web", "cpu", f64::NAN, 1_000).await.unwrap_err();
        assert!(matches!(err, ScaleError::InvalidSample { .. }));
        assert_eq!(agg.retained_samples("web").await, 0);
    }

    #[tokio::test]
    async fn empty_window_is_no_data() {
        let agg = aggregator();
        let err = agg
            .windowed_statistic("web", "cpu", Duration::from_secs(60), Aggregation::Mean, 100_000)
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::NoData { .. }));

        // Samples exist but fall outside the window.
        agg.record("web", "cpu", 90.0, 1_000).await.unwrap();
        let err = agg
            .windowed_statistic("web", "cpu", Duration::from_secs(60), Aggregation::Mean, 100_000)
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::NoData { .. }));
    }

    #[tokio::test]
    async fn window_excludes_older_samples() {
        let agg = aggregator();
        agg.record("web", "cpu", 100.0, 1_000).await.unwrap();
        agg.record("web", "cpu", 20.0, 50_000).await.unwrap();
        agg.record("web", "cpu", 40.0, 60_000).await.unwrap();

        let mean = agg
            .windowed_statistic("web", "cpu", Duration::from_secs(20), Aggregation::Mean, 60_000)
            .await
            .unwrap();
        assert_eq!(mean, 30.0);
    }

    #[tokio::test]
    async fn eviction_is_lazy_on_write() {
        let agg = aggregator();
        agg.set_retention("web", Duration::from_secs(10)).await;

        agg.record("web", "cpu", 1.0, 1_000).await.unwrap();
        agg.record("web", "cpu", 2.0, 5_000).await.unwrap();
        assert_eq!(agg.retained_samples("web").await, 2);

        // 20s later: both older samples fall outside the 10s retention.
        agg.record("web", "cpu", 3.0, 21_000).await.unwrap();
        assert_eq!(agg.retained_samples("web").await, 1);
    }

    #[tokio::test]
    async fn usage_profile_reports_history_depth() {
        let agg = aggregator();
        for i in 1..=20u64 {
            agg.record("api", "cpu_millis", (i * 10) as f64, i * 1_000).await.unwrap();
        }

        let profile = agg
            .usage_profile("api", "cpu_millis", Duration::from_secs(60), 95.0, 20_000)
            .await
            .unwrap();
        assert_eq!(profile.percentile, 190.0);
        assert_eq!(profile.max, 200.0);
        assert_eq!(profile.samples, 20);
        assert_eq!(profile.first_seen, 1_000);
        assert_eq!(profile.longest_gap, 1_000);
    }

    #[tokio::test]
    async fn usage_profile_reports_outage_as_gap() {
        let agg = aggregator();
        agg.set_retention("api", Duration::from_secs(8 * 3600)).await;
        agg.record("api", "cpu_millis", 950.0, 0).await.unwrap();
        agg.record("api", "cpu_millis", 20.0, 9 * 3_600_000).await.unwrap();

        let profile = agg
            .usage_profile("api", "cpu_millis", Duration::from_secs(8 * 3600), 95.0, 9 * 3_600_000)
            .await
            .unwrap();
        // Only the last sample is inside the window; the rest of it is a gap.
        assert_eq!(profile.samples, 1);
        assert_eq!(profile.first_seen, 0);
        assert_eq!(profile.longest_gap, 8 * 3_600_000);
    }

    #[tokio::test]
    async fn write_evicts_stale_sibling_series() {
        let agg = aggregator();
        agg.set_retention("web", Duration::from_secs(10)).await;
        agg.record("web", "memory", 1.0, 1_000).await.unwrap();
        agg.record("web", "cpu", 1.0, 2_000).await.unwrap();
        assert_eq!(agg.retained_samples("web").await, 2);

        // memory stopped reporting; a cpu write still ages it out.
        agg.record("web", "cpu", 2.0, 30_000).await.unwrap();
        assert_eq!(agg.retained_samples("web").await, 1);
        assert!(agg.samples("web", "memory", 0).await.is_empty());
    }

    #[tokio::test]
    async fn record_tracked_refuses_unknown_targets() {
        let agg = aggregator();
        let sample = MetricSample {
            target_id: "ghost".to_string(),
            metric: "cpu".to_string(),
            value: 1.0,
            timestamp: 1_000,
        };
        assert!(matches!(
            agg.record_tracked(&sample).await,
            Err(ScaleError::UnknownTarget(_))
        ));
        assert!(agg.tracked_targets().await.is_empty());

        agg.set_retention("ghost", Duration::from_secs(60)).await;
        agg.record_tracked(&sample).await.unwrap();
        assert_eq!(agg.retained_samples("ghost").await, 1);
    }

    #[tokio::test]
    async fn samples_read_back_after_since() {
        let agg = aggregator();
        agg.record("web", "cpu", 1.0, 1_000).await.unwrap();
        agg.record("web", "cpu", 2.0, 2_000).await.unwrap();

        let after = agg.samples("web", "cpu", 1_000).await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].value, 2.0);
        assert_eq!(agg.newest("web", "cpu").await, Some(2_000));
        assert!(agg.samples("nope", "cpu", 0).await.is_empty());
    }

    #[tokio::test]
    async fn remove_target_forgets_series() {
        let agg = aggregator();
        agg.record("web", "cpu", 1.0, 1_000).await.unwrap();
        assert_eq!(agg.tracked_targets().await, vec!["web".to_string()]);

        agg.remove_target("web").await;
        assert!(agg.tracked_targets().await.is_empty());
    }
}
