//! Fixed-bucket latency histogram.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bucket upper bounds in milliseconds.
const LATENCY_BUCKETS_MS: [u64; 10] = [1, 5, 10, 50, 100, 250, 500, 1_000, 5_000, 10_000];

/// Fixed-bucket histogram for query latencies in milliseconds.
///
/// Observations are lock-free; percentiles are approximate and report the
/// upper bound of the bucket holding the requested rank.
pub struct Histogram {
    buckets: Vec<u64>,
    /// Per-bucket counts (not cumulative).
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram with the default latency buckets
    /// (1ms, 5ms, 10ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s).
    pub fn latency() -> Self {
        Self::with_buckets(LATENCY_BUCKETS_MS.to_vec())
    }

    /// Histogram with caller-chosen ascending bucket bounds.
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Record a latency in milliseconds.
    pub fn observe(&self, value_ms: u64) {
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(value_ms, Ordering::Relaxed);

        let slot = self
            .buckets
            .iter()
            .position(|&boundary| value_ms <= boundary)
            .unwrap_or(self.buckets.len().saturating_sub(1));
        if let Some(count) = self.counts.get(slot) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Integer mean of all observations.
    pub fn avg(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        self.sum() / count
    }

    /// Approximate percentile, `p` in `0.0..=1.0`.
    pub fn percentile(&self, p: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (boundary, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target {
                return *boundary;
            }
        }
        self.buckets.last().copied().unwrap_or(0)
    }

    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    pub fn reset(&self) {
        self.sum.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }

    /// `(upper bound, count)` for every bucket.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        self.buckets
            .iter()
            .zip(&self.counts)
            .map(|(&boundary, count)| (boundary, count.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::latency()
    }
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Histogram")
            .field("count", &self.count())
            .field("max", &self.max())
            .field("p50", &self.p50())
            .field("p99", &self.p99())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_observe() {
        let hist = Histogram::latency();
        hist.observe(0);
        hist.observe(3);
        hist.observe(40);

        assert_eq!(hist.count(), 3);
        assert_eq!(hist.sum(), 43);
    }

    #[test]
    fn test_histogram_avg_and_max() {
        let hist = Histogram::latency();
        hist.observe(10);
        hist.observe(20);
        hist.observe(30);

        assert_eq!(hist.avg(), 20);
        assert_eq!(hist.max(), 30);
    }

    #[test]
    fn test_histogram_percentile() {
        let hist = Histogram::latency();
        for _ in 0..100 {
            hist.observe(1);
        }
        assert_eq!(hist.p50(), 1);
        assert_eq!(hist.p99(), 1);

        for _ in 0..100 {
            hist.observe(400);
        }
        assert_eq!(hist.p50(), 1);
        assert_eq!(hist.p99(), 500);
    }

    #[test]
    fn test_histogram_overflow_lands_in_last_bucket() {
        let hist = Histogram::latency();
        hist.observe(60_000);

        assert_eq!(hist.p99(), 10_000);
        assert_eq!(hist.max(), 60_000);
        assert_eq!(hist.snapshot().last(), Some(&(10_000, 1)));
    }

    #[test]
    fn test_histogram_empty() {
        let hist = Histogram::latency();
        assert_eq!(hist.count(), 0);
        assert_eq!(hist.avg(), 0);
        assert_eq!(hist.p50(), 0);
        assert_eq!(hist.max(), 0);
    }

    #[test]
    fn test_histogram_reset() {
        let hist = Histogram::latency();
        hist.observe(7);
        hist.observe(9);
        hist.reset();

        assert_eq!(hist.count(), 0);
        assert_eq!(hist.sum(), 0);
        assert!(hist.snapshot().iter().all(|(_, count)| *count == 0));
    }
}
