//! Aggregate and per-provider execution statistics.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::num::NonZeroUsize;

use lru::LruCache;
use multiorm_proto::{DatabaseQuery, ProviderId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::analysis::{analyze, QueryAnalysis};
use super::histogram::Histogram;
use super::shape::QueryShape;
use crate::config::DEFAULT_SLOW_QUERY_THRESHOLD_MS;

/// Distinct query shapes whose running averages are kept.
const MAX_TRACKED_SHAPES: usize = 1024;

/// Usage of one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub queries: u64,
    /// Running mean execution time in milliseconds.
    pub average_time_ms: f64,
    pub errors: u64,
}

/// Running statistics for one query shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeStats {
    pub executions: u64,
    pub average_time_ms: f64,
}

/// Point-in-time copy of the tracker's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_queries: u64,
    /// Running mean execution time in milliseconds.
    pub average_execution_time_ms: f64,
    /// Queries slower than the configured threshold.
    pub slow_queries: u64,
    /// Running fraction of failed queries (0.0 to 1.0).
    pub error_rate: f64,
    /// Providers that served at least one query since the last reset.
    pub provider_usage: BTreeMap<ProviderId, ProviderUsage>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub p50_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

impl PerformanceMetrics {
    /// Cache hit rate (0.0 to 1.0).
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

struct TrackerState {
    total_queries: u64,
    average_ms: f64,
    slow_queries: u64,
    error_rate: f64,
    providers: [ProviderUsage; ProviderId::COUNT],
    cache_hits: u64,
    cache_misses: u64,
    latency: Histogram,
    shapes: LruCache<QueryShape, ShapeStats>,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            total_queries: 0,
            average_ms: 0.0,
            slow_queries: 0,
            error_rate: 0.0,
            providers: [ProviderUsage::default(); ProviderId::COUNT],
            cache_hits: 0,
            cache_misses: 0,
            latency: Histogram::latency(),
            shapes: LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_SHAPES).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }
}

/// `(old * (n - 1) + sample) / n`, the running mean after the n-th sample.
fn incremental_mean(old: f64, sample: f64, n: u64) -> f64 {
    let n = n as f64;
    (old * (n - 1.0) + sample) / n
}

/// Performance tracker owned by the router.
///
/// All mutable state sits behind one mutex, so concurrent `record` calls
/// never lose updates to the running means and `reset`/`snapshot` never
/// observe a half-applied sample. The lock is only held for arithmetic,
/// never across an adapter call.
pub struct PerformanceTracker {
    slow_query_threshold_ms: u64,
    state: Mutex<TrackerState>,
}

impl PerformanceTracker {
    pub fn new(slow_query_threshold_ms: u64) -> Self {
        Self {
            slow_query_threshold_ms,
            state: Mutex::new(TrackerState::new()),
        }
    }

    pub fn slow_query_threshold_ms(&self) -> u64 {
        self.slow_query_threshold_ms
    }

    /// Record one executed query or transaction.
    pub fn record(&self, provider: ProviderId, execution_time_ms: u64, is_error: bool) {
        let sample = execution_time_ms as f64;
        let error = if is_error { 1.0 } else { 0.0 };

        let mut state = self.state.lock();
        state.total_queries += 1;
        let n = state.total_queries;
        state.average_ms = incremental_mean(state.average_ms, sample, n);
        state.error_rate = incremental_mean(state.error_rate, error, n);
        if execution_time_ms > self.slow_query_threshold_ms {
            state.slow_queries += 1;
        }
        state.latency.observe(execution_time_ms);

        let usage = &mut state.providers[provider.index()];
        usage.queries += 1;
        usage.average_time_ms = incremental_mean(usage.average_time_ms, sample, usage.queries);
        if is_error {
            usage.errors += 1;
        }
    }

    /// Fold a sample into the running average of its query shape.
    pub fn record_shape(&self, shape: QueryShape, execution_time_ms: u64) {
        let mut state = self.state.lock();
        let stats = state.shapes.get_or_insert_mut(shape, ShapeStats::default);
        stats.executions += 1;
        stats.average_time_ms =
            incremental_mean(stats.average_time_ms, execution_time_ms as f64, stats.executions);
    }

    /// History for a shape, if it has executed since the last reset.
    pub fn shape_stats(&self, shape: &QueryShape) -> Option<ShapeStats> {
        self.state.lock().shapes.peek(shape).copied()
    }

    pub fn record_cache_hit(&self) {
        self.state.lock().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.state.lock().cache_misses += 1;
    }

    /// Owned copy of every counter.
    pub fn snapshot(&self) -> PerformanceMetrics {
        let state = self.state.lock();
        let provider_usage = ProviderId::ALL
            .iter()
            .filter_map(|&provider| {
                let usage = state.providers[provider.index()];
                (usage.queries > 0).then_some((provider, usage))
            })
            .collect();

        PerformanceMetrics {
            total_queries: state.total_queries,
            average_execution_time_ms: state.average_ms,
            slow_queries: state.slow_queries,
            error_rate: state.error_rate,
            provider_usage,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            p50_ms: state.latency.p50(),
            p99_ms: state.latency.p99(),
            max_ms: state.latency.max(),
        }
    }

    /// Zero every counter, per-provider entry and shape history.
    pub fn reset(&self) {
        *self.state.lock() = TrackerState::new();
    }

    /// Heuristic analysis informed by this tracker's shape history.
    pub fn analyze(&self, query: &DatabaseQuery) -> QueryAnalysis {
        let history = self.shape_stats(&QueryShape::of(query));
        analyze(query, history, self.slow_query_threshold_ms)
    }

    /// Export the counters in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let metrics = self.snapshot();
        let mut out = String::new();

        let mut scalar = |name: &str, kind: &str, help: &str, value: String| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}\n");
        };
        scalar(
            "multiorm_queries_total",
            "counter",
            "Total queries and transactions executed",
            metrics.total_queries.to_string(),
        );
        scalar(
            "multiorm_query_duration_ms_avg",
            "gauge",
            "Mean execution time in milliseconds",
            format!("{:.3}", metrics.average_execution_time_ms),
        );
        scalar(
            "multiorm_query_duration_ms_p50",
            "gauge",
            "P50 execution time in milliseconds",
            metrics.p50_ms.to_string(),
        );
        scalar(
            "multiorm_query_duration_ms_p99",
            "gauge",
            "P99 execution time in milliseconds",
            metrics.p99_ms.to_string(),
        );
        scalar(
            "multiorm_query_duration_ms_max",
            "gauge",
            "Slowest execution time in milliseconds",
            metrics.max_ms.to_string(),
        );
        scalar(
            "multiorm_slow_queries_total",
            "counter",
            "Queries slower than the slow-query threshold",
            metrics.slow_queries.to_string(),
        );
        scalar(
            "multiorm_error_rate",
            "gauge",
            "Fraction of queries that failed",
            format!("{:.4}", metrics.error_rate),
        );
        scalar(
            "multiorm_cache_hits_total",
            "counter",
            "Query cache hits",
            metrics.cache_hits.to_string(),
        );
        scalar(
            "multiorm_cache_misses_total",
            "counter",
            "Query cache misses",
            metrics.cache_misses.to_string(),
        );

        out.push_str("# HELP multiorm_provider_queries_total Queries served per provider\n");
        out.push_str("# TYPE multiorm_provider_queries_total counter\n");
        for (provider, usage) in &metrics.provider_usage {
            let _ = writeln!(
                out,
                "multiorm_provider_queries_total{{provider=\"{provider}\"}} {}",
                usage.queries
            );
        }
        out.push_str("\n# HELP multiorm_provider_errors_total Failed queries per provider\n");
        out.push_str("# TYPE multiorm_provider_errors_total counter\n");
        for (provider, usage) in &metrics.provider_usage {
            let _ = writeln!(
                out,
                "multiorm_provider_errors_total{{provider=\"{provider}\"}} {}",
                usage.errors
            );
        }
        out.push_str(
            "\n# HELP multiorm_provider_duration_ms_avg Mean execution time per provider\n",
        );
        out.push_str("# TYPE multiorm_provider_duration_ms_avg gauge\n");
        for (provider, usage) in &metrics.provider_usage {
            let _ = writeln!(
                out,
                "multiorm_provider_duration_ms_avg{{provider=\"{provider}\"}} {:.3}",
                usage.average_time_ms
            );
        }
        out
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_QUERY_THRESHOLD_MS)
    }
}

impl std::fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTracker")
            .field("slow_query_threshold_ms", &self.slow_query_threshold_ms)
            .field("metrics", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_record_running_means() {
        let tracker = PerformanceTracker::new(100);
        tracker.record(ProviderId::Sqlite, 10, false);
        tracker.record(ProviderId::Sqlite, 20, false);
        tracker.record(ProviderId::Memory, 30, true);
        tracker.record(ProviderId::Memory, 500, false);

        let metrics = tracker.snapshot();
        assert_eq!(metrics.total_queries, 4);
        assert!((metrics.average_execution_time_ms - 140.0).abs() < 1e-9);
        assert_eq!(metrics.slow_queries, 1);
        assert!((metrics.error_rate - 0.25).abs() < 1e-9);

        let sqlite = metrics.provider_usage[&ProviderId::Sqlite];
        assert_eq!(sqlite.queries, 2);
        assert!((sqlite.average_time_ms - 15.0).abs() < 1e-9);
        assert_eq!(sqlite.errors, 0);

        let memory = metrics.provider_usage[&ProviderId::Memory];
        assert_eq!(memory.errors, 1);
        assert!(!metrics.provider_usage.contains_key(&ProviderId::Sled));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let tracker = PerformanceTracker::new(1000);
        tracker.record(ProviderId::Sled, 1000, false);
        tracker.record(ProviderId::Sled, 1001, false);
        assert_eq!(tracker.snapshot().slow_queries, 1);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let tracker = PerformanceTracker::default();
        tracker.record(ProviderId::Sqlite, 5, false);

        let mut snapshot = tracker.snapshot();
        snapshot.total_queries = 99;
        snapshot.provider_usage.clear();

        let fresh = tracker.snapshot();
        assert_eq!(fresh.total_queries, 1);
        assert_eq!(fresh.provider_usage.len(), 1);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let tracker = PerformanceTracker::default();
        tracker.record(ProviderId::Sqlite, 5, true);
        tracker.record_cache_hit();
        tracker.record_cache_miss();
        let query: DatabaseQuery = DatabaseQuery::select("t").into();
        tracker.record_shape(QueryShape::of(&query), 5);

        tracker.reset();

        assert_eq!(tracker.snapshot(), PerformanceMetrics::default());
        assert!(tracker.shape_stats(&QueryShape::of(&query)).is_none());
    }

    #[test]
    fn test_shape_averages() {
        let tracker = PerformanceTracker::default();
        let shape = QueryShape::of(&DatabaseQuery::select("t").filter("a", 1).into());
        tracker.record_shape(shape, 10);
        tracker.record_shape(shape, 30);

        let stats = tracker.shape_stats(&shape).unwrap();
        assert_eq!(stats.executions, 2);
        assert!((stats.average_time_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let tracker = Arc::new(PerformanceTracker::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        tracker.record(ProviderId::Memory, 7, false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = tracker.snapshot();
        assert_eq!(metrics.total_queries, 2000);
        assert_eq!(metrics.average_execution_time_ms, 7.0);
        assert_eq!(metrics.provider_usage[&ProviderId::Memory].queries, 2000);
    }

    #[test]
    fn test_prometheus_export() {
        let tracker = PerformanceTracker::default();
        tracker.record(ProviderId::Sqlite, 3, false);
        tracker.record_cache_hit();

        let text = tracker.to_prometheus();
        assert!(text.contains("# TYPE multiorm_queries_total counter"));
        assert!(text.contains("multiorm_queries_total 1"));
        assert!(text.contains("multiorm_cache_hits_total 1"));
        assert!(text.contains("multiorm_provider_queries_total{provider=\"sqlite\"} 1"));
    }
}
