//! Rolling sample window for a single (target, metric) series.

use std::collections::VecDeque;

use gridscale_core::{Aggregation, Timestamp};

/// Time-ordered samples for one series.
///
/// Timestamps are strictly increasing; a push that is not newer than the
/// newest sample is refused rather than reordered.
#[derive(Debug, Default, Clone)]
pub struct MetricWindow {
    samples: VecDeque<(Timestamp, f64)>,
    /// First timestamp ever accepted, kept across eviction.
    first_seen: Option<Timestamp>,
}

impl MetricWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Returns the newest timestamp on rejection.
    pub fn push(&mut self, timestamp: Timestamp, value: f64) -> Result<(), Timestamp> {
        if let Some(newest) = self.newest()
            && timestamp <= newest
        {
            return Err(newest);
        }
        self.samples.push_back((timestamp, value));
        self.first_seen.get_or_insert(timestamp);
        Ok(())
    }

    /// Drop samples older than `cutoff`. Returns how many were evicted.
    pub fn evict_before(&mut self, cutoff: Timestamp) -> usize {
        let keep_from = self.samples.partition_point(|(ts, _)| *ts < cutoff);
        self.samples.drain(..keep_from);
        keep_from
    }

    pub fn newest(&self) -> Option<Timestamp> {
        self.samples.back().map(|(ts, _)| *ts)
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.samples.front().map(|(ts, _)| *ts)
    }

    pub fn first_seen(&self) -> Option<Timestamp> {
        self.first_seen
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Values with timestamps in `[from, to]`.
    pub fn values_between(&self, from: Timestamp, to: Timestamp) -> Vec<f64> {
        self.points_between(from, to).map(|(_, v)| v).collect()
    }

    /// Samples with timestamps in `[from, to]`, oldest first.
    pub fn points_between(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> impl Iterator<Item = (Timestamp, f64)> + '_ {
        let start = self.samples.partition_point(|(ts, _)| *ts < from);
        self.samples
            .range(start..)
            .take_while(move |(ts, _)| *ts <= to)
            .copied()
    }

    /// Samples strictly after `since`, oldest first.
    pub fn since(&self, since: Timestamp) -> impl Iterator<Item = (Timestamp, f64)> + '_ {
        let start = self.samples.partition_point(|(ts, _)| *ts <= since);
        self.samples.range(start..).copied()
    }
}

/// Reduce `values` with the given aggregation. `None` when empty.
pub fn aggregate(values: &[f64], aggregation: Aggregation) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match aggregation {
        Aggregation::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
        Aggregation::Max => values.iter().copied().reduce(f64::max),
        Aggregation::Min => values.iter().copied().reduce(f64::min),
        Aggregation::P50 | Aggregation::P90 | Aggregation::P95 | Aggregation::P99 => {
            percentile(values, aggregation.percentile().unwrap_or(100.0))
        }
    }
}

/// Longest stretch of `[from, to]` without a sample, in milliseconds.
///
/// `timestamps` must be sorted and lie inside the range. An empty slice
/// leaves the whole range uncovered.
pub fn longest_gap(timestamps: &[Timestamp], from: Timestamp, to: Timestamp) -> u64 {
    let (Some(first), Some(last)) = (timestamps.first(), timestamps.last()) else {
        return to.saturating_sub(from);
    };
    let inner = timestamps
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .max()
        .unwrap_or(0);
    inner
        .max(first.saturating_sub(from))
        .max(to.saturating_sub(*last))
}

/// Nearest-rank percentile of `values`. `None` when empty.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);

    let rank = ((q / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filled(points: &[(Timestamp, f64)]) -> MetricWindow {
        let mut w = MetricWindow::new();
        for (ts, v) in points {
            w.push(*ts, *v).unwrap();
        }
        w
    }

    #[test]
    fn rejects_out_of_order_and_duplicates() {
        let mut w = filled(&[(10, 1.0), (20, 2.0)]);
        assert_eq!(w.push(15, 3.0), Err(20));
        assert_eq!(w.push(20, 3.0), Err(20));
        assert_eq!(w.len(), 2);
        assert!(w.push(21, 3.0).is_ok());
    }

    #[test]
    fn eviction_keeps_first_seen() {
        let mut w = filled(&[(10, 1.0), (20, 2.0), (30, 3.0)]);
        assert_eq!(w.evict_before(25), 2);
        assert_eq!(w.oldest(), Some(30));
        assert_eq!(w.first_seen(), Some(10));
    }

    #[test]
    fn values_between_is_inclusive() {
        let w = filled(&[(10, 1.0), (20, 2.0), (30, 3.0), (40, 4.0)]);
        assert_eq!(w.values_between(20, 30), vec![2.0, 3.0]);
        assert!(w.values_between(41, 50).is_empty());
    }

    #[test]
    fn since_is_exclusive() {
        let w = filled(&[(10, 1.0), (20, 2.0), (30, 3.0)]);
        let after: Vec<_> = w.since(20).collect();
        assert_eq!(after, vec![(30, 3.0)]);
    }

    #[test]
    fn longest_gap_counts_edges() {
        assert_eq!(longest_gap(&[], 0, 100), 100);
        assert_eq!(longest_gap(&[0, 10, 20, 100], 0, 100), 80);
        // Uncovered head and tail of the range count as gaps.
        assert_eq!(longest_gap(&[90], 0, 100), 90);
        assert_eq!(longest_gap(&[0, 5], 0, 100), 95);
    }

    #[test]
    fn aggregations() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(aggregate(&values, Aggregation::Mean), Some(2.5));
        assert_eq!(aggregate(&values, Aggregation::Max), Some(4.0));
        assert_eq!(aggregate(&values, Aggregation::Min), Some(1.0));
        assert_eq!(aggregate(&values, Aggregation::P50), Some(2.0));
        assert_eq!(aggregate(&[], Aggregation::Mean), None);
    }

    #[test]
    fn p95_of_hundred_values() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&values, 95.0), Some(95.0));
        assert_eq!(percentile(&values, 100.0), Some(100.0));
        assert_eq!(percentile(&[7.0], 95.0), Some(7.0));
    }

    proptest! {
        #[test]
        fn windowed_aggregate_matches_direct(
            deltas in prop::collection::vec(1u64..1_000, 1..64),
            values in prop::collection::vec(0.0f64..1_000.0, 64),
        ) {
            let mut w = MetricWindow::new();
            let mut ts = 0;
            let mut points = Vec::new();
            for (delta, value) in deltas.iter().zip(values.iter()) {
                ts += delta;
                w.push(ts, *value).unwrap();
                points.push(*value);
            }

            let got = w.values_between(0, ts);
            prop_assert_eq!(&got, &points);

            let mean = points.iter().sum::<f64>() / points.len() as f64;
            let max = points.iter().cloned().fold(f64::MIN, f64::max);
            let mut sorted = points.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let rank = (0.95 * sorted.len() as f64).ceil() as usize;
            let p95 = sorted[rank.max(1) - 1];

            prop_assert!((aggregate(&got, Aggregation::Mean).unwrap() - mean).abs() < 1e-9);
            prop_assert_eq!(aggregate(&got, Aggregation::Max).unwrap(), max);
            prop_assert_eq!(aggregate(&got, Aggregation::P95).unwrap(), p95);
        }

        #[test]
        fn push_keeps_timestamps_strictly_increasing(
            stamps in prop::collection::vec(0u64..500, 0..64),
        ) {
            let mut w = MetricWindow::new();
            for ts in stamps {
                let _ = w.push(ts, 1.0);
            }
            let all: Vec<_> = w.since(0).map(|(ts, _)| ts).collect();
            prop_assert!(all.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
