//! Push ingestion — metric samples as JSON lines.
//!
//! ```text
//! {"target_id":"web","metric":"cpu","value":72.5,"timestamp":1700000000000}
//! {"target_id":"web","metric":"cpu","value":64.0}
//! ```
//!
//! A missing timestamp means "now". Blank lines and lines starting with
//! `#` are ignored. Samples for targets the engine does not manage are
//! rejected, so stray input cannot grow the series map.

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use gridscale_core::{epoch_millis, MetricSample, Timestamp};
use gridscale_metrics::MetricsAggregator;

#[derive(Debug, Deserialize)]
struct PushedSample {
    target_id: String,
    metric: String,
    value: f64,
    #[serde(default)]
    timestamp: Option<Timestamp>,
}

/// Counters for one ingestion stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub recorded: usize,
    pub malformed: usize,
    pub rejected: usize,
}

/// Parse one input line. `Ok(None)` for lines that carry no sample.
pub fn parse_line(line: &str, now: Timestamp) -> anyhow::Result<Option<MetricSample>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let pushed: PushedSample = serde_json::from_str(line).context("invalid sample line")?;
    Ok(Some(MetricSample {
        target_id: pushed.target_id,
        metric: pushed.metric,
        value: pushed.value,
        timestamp: pushed.timestamp.unwrap_or(now),
    }))
}

/// Read samples from `reader` into the aggregator until EOF or shutdown.
pub async fn ingest<R>(
    reader: R,
    aggregator: MetricsAggregator,
    mut shutdown: watch::Receiver<bool>,
) -> IngestStats
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = IngestStats::default();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(recorded = stats.recorded, "sample input closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "sample input failed");
                break;
            }
        };

        let sample = match parse_line(&line, epoch_millis()) {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "malformed sample skipped");
                stats.malformed += 1;
                continue;
            }
        };

        match aggregator.record_tracked(&sample).await {
            Ok(()) => stats.recorded += 1,
            Err(e) => {
                warn!(error = %e, "sample rejected");
                stats.rejected += 1;
            }
        }
    }

    debug!(
        recorded = stats.recorded,
        malformed = stats.malformed,
        rejected = stats.rejected,
        "ingestion stopped"
    );
    stats
}
