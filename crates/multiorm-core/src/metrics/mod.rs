//! Performance tracking.
//!
//! The router owns one [`PerformanceTracker`] and records every executed
//! query and transaction into it: counts, running mean latency, slow
//! queries, error rate, and per-provider usage. Cache hits are counted
//! separately and never charged to a provider.
//!
//! # Usage
//!
//! ```ignore
//! use multiorm_core::metrics::PerformanceTracker;
//! use multiorm_proto::ProviderId;
//!
//! let tracker = PerformanceTracker::new(1000);
//! tracker.record(ProviderId::Sqlite, 12, false);
//!
//! let metrics = tracker.snapshot();
//! assert_eq!(metrics.total_queries, 1);
//!
//! // Export to Prometheus format
//! let text = tracker.to_prometheus();
//! ```

mod analysis;
mod histogram;
mod shape;
mod tracker;

pub use analysis::{analyze, QueryAnalysis};
pub use histogram::Histogram;
pub use shape::{operator_names, QueryShape};
pub use tracker::{PerformanceMetrics, PerformanceTracker, ProviderUsage, ShapeStats};
