//! Engine-side counters for the metrics collaborator.
//!
//! The collector scrapes snapshots; the engine only keeps lock-free atomics
//! hot enough for the transaction path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket upper bounds for transaction durations, in microseconds.
const BUCKET_BOUNDS_US: [u64; 10] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000, 250_000, 1_000_000,
];

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket duration histogram.
pub struct DurationHistogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_US.len() + 1],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }
}

impl DurationHistogram {
    pub fn observe(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(BUCKET_BOUNDS_US.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds_us: &BUCKET_BOUNDS_US,
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds in microseconds; the last bucket is unbounded.
    pub bounds_us: &'static [u64],
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_us: u64,
}

/// All counters the engine exports.
#[derive(Default)]
pub struct MetaMetrics {
    /// End-to-end duration of each transaction, retries included.
    pub txn_durations: DurationHistogram,
    /// Optimistic transaction restarts caused by watched-key conflicts.
    pub txn_restarts: Counter,
}

impl MetaMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            txn_durations: self.txn_durations.snapshot(),
            txn_restarts: self.txn_restarts.get(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub txn_durations: HistogramSnapshot,
    pub txn_restarts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_sum() {
        let h = DurationHistogram::default();
        h.observe(Duration::from_micros(50));
        h.observe(Duration::from_micros(900));
        h.observe(Duration::from_secs(5));

        let snap = h.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.buckets[0], 1); // <= 100us
        assert_eq!(snap.buckets[3], 1); // <= 1ms
        assert_eq!(snap.buckets[BUCKET_BOUNDS_US.len()], 1); // overflow
        assert_eq!(snap.sum_us, 50 + 900 + 5_000_000);
    }

    #[test]
    fn restart_counter() {
        let m = MetaMetrics::default();
        m.txn_restarts.incr();
        m.txn_restarts.incr();
        assert_eq!(m.snapshot().txn_restarts, 2);
    }
}
