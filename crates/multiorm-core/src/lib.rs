//! MultiORM Core - query routing, backend adapters, caching, and metrics.
//!
//! This crate provides the runtime half of MultiORM: a [`QueryRouter`] that
//! dispatches [`multiorm_proto::DatabaseQuery`] values to one of several
//! storage backends, with a best-effort cache in front and a performance
//! tracker behind.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod router;

pub use adapter::{
    build_adapters, AdapterCapabilities, AdapterSet, DatabaseAdapter, Deadline, MemoryAdapter,
    SledAdapter, SqliteAdapter,
};
pub use cache::{
    build_cache_store, CacheEntry, CacheStats, CacheStore, CacheStoreExt, Clock,
    CompressedCacheStore, EncryptedCacheStore, ManualClock, MemoryCacheStore, RedisCacheStore,
    SystemClock,
};
pub use config::{
    AdaptersConfig, CacheBackendConfig, CacheConfig, CompressionConfig, EncryptionConfig,
    MemoryConfig, MultiOrmConfig, RouterConfig, SledConfig, SqliteConfig,
};
pub use error::{AdapterError, ConfigError, RouterError};

// Metrics exports
pub use metrics::{
    Histogram, PerformanceMetrics, PerformanceTracker, ProviderUsage, QueryAnalysis, QueryShape,
};

// Router exports
pub use router::{
    CacheInvalidationInterceptor, LoggingInterceptor, QueryInterceptor, QueryRouter,
    RequestContext, Selection, SelectionReason,
};

/// Re-export protocol types.
pub use multiorm_proto as proto;
