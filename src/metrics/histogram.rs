use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Number of histogram buckets.
pub const NUM_BUCKETS: usize = 10;

/// Bucket boundaries in nanoseconds.
/// 10 buckets: <1us, 1us-10us, 10us-100us, 100us-1ms, 1ms-10ms,
/// 10ms-100ms, 100ms-1s, 1s-10s, 10s-100s, 100s+.
const BOUNDARIES: [u64; 9] = [
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
];

/// Exponential histogram of event-loop stall durations.
/// Recording is atomic and safe for concurrent use.
#[derive(Default)]
pub struct LagHistogram {
    buckets: [AtomicU64; NUM_BUCKETS],
}

impl LagHistogram {
    /// Creates a histogram with all buckets at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one stall duration in the matching bucket.
    pub fn record(&self, lag: Duration) {
        let idx = bucket_index(lag.as_nanos() as u64);
        if let Some(bucket) = self.buckets.get(idx) {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total recorded stalls across all buckets.
    pub fn count(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    /// Current counts as a serializable snapshot.
    pub fn snapshot(&self) -> LagHistogramSnapshot {
        let load = |i: usize| {
            self.buckets
                .get(i)
                .map(|b| b.load(Ordering::Relaxed))
                .unwrap_or(0)
        };

        LagHistogramSnapshot {
            le_1us: load(0),
            le_10us: load(1),
            le_100us: load(2),
            le_1ms: load(3),
            le_10ms: load(4),
            le_100ms: load(5),
            le_1s: load(6),
            le_10s: load(7),
            le_100s: load(8),
            inf: load(9),
        }
    }
}

impl std::fmt::Debug for LagHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LagHistogram")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Histogram counts under their bucket upper-bound names, as exported in
/// the snapshot payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LagHistogramSnapshot {
    pub le_1us: u64,
    pub le_10us: u64,
    pub le_100us: u64,
    pub le_1ms: u64,
    pub le_10ms: u64,
    pub le_100ms: u64,
    pub le_1s: u64,
    pub le_10s: u64,
    pub le_100s: u64,
    pub inf: u64,
}

/// Returns the bucket index for a duration in nanoseconds.
fn bucket_index(value_ns: u64) -> usize {
    // Linear scan is fine for 9 boundaries.
    for (i, &boundary) in BOUNDARIES.iter().enumerate() {
        if value_ns < boundary {
            return i;
        }
    }
    9 // +inf bucket
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index_edges() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(999), 0);
        assert_eq!(bucket_index(1_000), 1);
        assert_eq!(bucket_index(999_999), 3);
        assert_eq!(bucket_index(1_000_000), 4);
        assert_eq!(bucket_index(100_000_000_000), 9);
        assert_eq!(bucket_index(u64::MAX), 9);
    }

    #[test]
    fn test_record_and_snapshot() {
        let h = LagHistogram::new();
        h.record(Duration::from_micros(5)); // 1us-10us
        h.record(Duration::from_micros(5));
        h.record(Duration::from_millis(50)); // 10ms-100ms
        h.record(Duration::from_secs(2)); // 1s-10s

        let snap = h.snapshot();
        assert_eq!(snap.le_10us, 2);
        assert_eq!(snap.le_100ms, 1);
        assert_eq!(snap.le_10s, 1);
        assert_eq!(snap.le_1us, 0);
        assert_eq!(h.count(), 4);
    }

    #[test]
    fn test_empty_snapshot_serializes_named_buckets() {
        let h = LagHistogram::new();
        let json = serde_json::to_value(h.snapshot()).expect("serialize");
        assert_eq!(json["le_1us"], 0);
        assert_eq!(json["inf"], 0);
    }
}
