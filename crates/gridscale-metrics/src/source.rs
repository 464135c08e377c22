//! Pull-based ingestion from an external monitoring backend.
//!
//! A [`MetricSource`] is polled by [`MetricsPoller`] on its own task, so
//! slow or failing backends never block the evaluation loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use gridscale_core::{MetricSample, TargetId, Timestamp};

use crate::aggregator::MetricsAggregator;

/// Boxed future returned by [`MetricSource::fetch`].
pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<Vec<MetricSample>>> + Send + 'a>>;

/// A monitoring backend the aggregator can pull samples from.
pub trait MetricSource: Send + Sync {
    /// Fetch samples of one series with timestamps after `since`, oldest first.
    fn fetch<'a>(
        &'a self,
        target_id: &'a str,
        metric: &'a str,
        since: Timestamp,
    ) -> FetchFuture<'a>;
}

/// Outcome counters for one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub recorded: usize,
    pub rejected: usize,
    pub failed_series: usize,
}

/// Periodically pulls every watched series into the aggregator.
pub struct MetricsPoller {
    aggregator: MetricsAggregator,
    source: Arc<dyn MetricSource>,
    /// Watched (target, metric) pairs.
    series: RwLock<Vec<(TargetId, String)>>,
    interval: Duration,
}

impl MetricsPoller {
    pub fn new(
        aggregator: MetricsAggregator,
        source: Arc<dyn MetricSource>,
        interval: Duration,
    ) -> Self {
        Self {
            aggregator,
            source,
            series: RwLock::new(Vec::new()),
            interval,
        }
    }

    /// Start pulling a series.
    pub async fn watch(&self, target_id: &str, metric: &str) {
        let mut series = self.series.write().await;
        if !series.iter().any(|(t, m)| t == target_id && m == metric) {
            series.push((target_id.to_string(), metric.to_string()));
            debug!(%target_id, %metric, "series watched");
        }
    }

    /// Stop pulling every series of a target.
    pub async fn unwatch(&self, target_id: &str) {
        self.series.write().await.retain(|(t, _)| t != target_id);
        debug!(%target_id, "series unwatched");
    }

    pub async fn watched(&self) -> Vec<(TargetId, String)> {
        self.series.read().await.clone()
    }

    /// Pull each watched series once, starting after its newest sample.
    pub async fn poll_once(&self) -> PollReport {
        let series = self.series.read().await.clone();
        let mut report = PollReport::default();

        for (target_id, metric) in &series {
            let since = self.aggregator.newest(target_id, metric).await.unwrap_or(0);
            let samples = match self.source.fetch(target_id, metric, since).await {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(%target_id, %metric, error = %e, "metric fetch failed");
                    report.failed_series += 1;
                    continue;
                }
            };

            for sample in samples {
                let recorded = self
                    .aggregator
                    .record(target_id, metric, sample.value, sample.timestamp)
                    .await;
                match recorded {
                    Ok(()) => report.recorded += 1,
                    Err(e) => {
                        debug!(%target_id, %metric, error = %e, "fetched sample rejected");
                        report.rejected += 1;
                    }
                }
            }
        }

        report
    }

    /// Run the polling loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "metrics poller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let report = self.poll_once().await;
                    debug!(
                        recorded = report.recorded,
                        rejected = report.rejected,
                        failed = report.failed_series,
                        "metrics poll complete"
                    );
                }
                _ = shutdown.changed() => {
                    info!("metrics poller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_core::Aggregation;
    use std::sync::Mutex;

    /// Serves canned samples and remembers the `since` it was asked for.
    struct StaticSource {
        samples: Vec<MetricSample>,
        calls: Mutex<Vec<Timestamp>>,
        fail: bool,
    }

    impl StaticSource {
        fn new(samples: Vec<MetricSample>) -> Self {
            Self {
                samples,
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl MetricSource for StaticSource {
        fn fetch<'a>(
            &'a self,
            target_id: &'a str,
            metric: &'a str,
            since: Timestamp,
        ) -> FetchFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(since);
                if self.fail {
                    anyhow::bail!("backend unavailable");
                }
                let samples: Vec<MetricSample> = self
                    .samples
                    .iter()
                    .filter(|s| {
                        s.target_id == target_id && s.metric == metric && s.timestamp > since
                    })
                    .cloned()
                    .collect();
                Ok(samples)
            })
        }
    }

    fn sample(ts: Timestamp, value: f64) -> MetricSample {
        MetricSample {
            target_id: "web".to_string(),
            metric: "cpu".to_string(),
            value,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn poll_records_fetched_samples() {
        let agg = MetricsAggregator::new(Duration::from_secs(3600));
        let source = Arc::new(StaticSource::new(vec![sample(1_000, 40.0), sample(2_000, 60.0)]));
        let poller = MetricsPoller::new(agg.clone(), source.clone(), Duration::from_secs(15));
        poller.watch("web", "cpu").await;
        poller.watch("web", "cpu").await;
        assert_eq!(poller.watched().await.len(), 1);

        let report = poller.poll_once().await;
        assert_eq!(report.recorded, 2);

        let mean = agg
            .windowed_statistic("web", "cpu", Duration::from_secs(60), Aggregation::Mean, 2_000)
            .await
            .unwrap();
        assert_eq!(mean, 50.0);

        // Second pass asks only for samples after the newest one.
        let report = poller.poll_once().await;
        assert_eq!(report.recorded, 0);
        assert_eq!(*source.calls.lock().unwrap(), vec![0, 2_000]);
    }

    #[tokio::test]
    async fn fetch_failure_is_counted_not_fatal() {
        let agg = MetricsAggregator::new(Duration::from_secs(3600));
        let mut source = StaticSource::new(vec![]);
        source.fail = true;
        let poller = MetricsPoller::new(agg, Arc::new(source), Duration::from_secs(15));
        poller.watch("web", "cpu").await;
        poller.watch("api", "cpu").await;

        let report = poller.poll_once().await;
        assert_eq!(report.failed_series, 2);
    }

    #[tokio::test]
    async fn out_of_order_fetch_is_rejected() {
        let agg = MetricsAggregator::new(Duration::from_secs(3600));
        let source = Arc::new(StaticSource::new(vec![sample(2_000, 1.0), sample(1_500, 2.0)]));
        let poller = MetricsPoller::new(agg, source, Duration::from_secs(15));
        poller.watch("web", "cpu").await;

        let report = poller.poll_once().await;
        assert_eq!(report.recorded, 1);
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn unwatch_drops_target_series() {
        let agg = MetricsAggregator::new(Duration::from_secs(3600));
        let source = Arc::new(StaticSource::new(vec![]));
        let poller = MetricsPoller::new(agg, source, Duration::from_secs(15));
        poller.watch("web", "cpu").await;
        poller.watch("web", "memory").await;
        poller.watch("api", "cpu").await;

        poller.unwatch("web").await;
        assert_eq!(poller.watched().await, vec![("api".to_string(), "cpu".to_string())]);
    }
}
