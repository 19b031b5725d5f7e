//! The query router.
//!
//! [`QueryRouter`] dispatches provider-agnostic queries and transactions to
//! one of the registered adapters. For each query it:
//!
//! 1. validates the query
//! 2. serves cacheable reads from the cache store when asked to
//! 3. selects a provider (see [`selection::select`])
//! 4. runs the interceptors' `before` stage
//! 5. executes, handing the adapter the query's deadline
//! 6. runs `after_success` or `after_error`
//! 7. writes cacheable results through to the cache
//! 8. records the outcome in the performance tracker
//!
//! Adapter failures are recorded and surfaced, never absorbed. Cache
//! failures are absorbed by the cache store itself.

mod cache_key;
mod interceptor;
pub mod selection;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use multiorm_proto::{
    DatabaseQuery, ProviderId, QueryResult, TransactionOptions, TransactionResult,
};
use tracing::{debug, warn};

use crate::adapter::{build_adapters, AdapterSet, DatabaseAdapter};
use crate::cache::{build_cache_store, CacheStore, CacheStoreExt};
use crate::config::{MultiOrmConfig, RouterConfig};
use crate::error::{AdapterError, ConfigError, RouterError};
use crate::metrics::{PerformanceMetrics, PerformanceTracker, QueryAnalysis, QueryShape};

pub use cache_key::{cache_key, prefix_pattern, table_pattern, UNTABLED_SEGMENT};
pub use interceptor::{
    CacheInvalidationInterceptor, LoggingInterceptor, Operation, QueryInterceptor, RequestContext,
};
pub use selection::{Selection, SelectionReason, Workload};

/// Orchestrates cache, adapter selection, execution and metrics.
pub struct QueryRouter {
    config: RouterConfig,
    cache: Arc<dyn CacheStore>,
    adapters: AdapterSet,
    tracker: PerformanceTracker,
    interceptors: Vec<Arc<dyn QueryInterceptor>>,
    next_request_id: AtomicU64,
}

impl QueryRouter {
    /// Router over injected collaborators, with no interceptors.
    pub fn new(config: RouterConfig, cache: Arc<dyn CacheStore>, adapters: AdapterSet) -> Self {
        let tracker = PerformanceTracker::new(config.slow_query_threshold_ms);
        Self {
            config,
            cache,
            adapters,
            tracker,
            interceptors: Vec::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Build the cache store and adapters described by `config`.
    ///
    /// Adapters are constructed but not connected; call
    /// [`connect_all`](Self::connect_all).
    pub fn from_config(config: &MultiOrmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = build_cache_store(&config.cache)?;
        let adapters = build_adapters(&config.adapters);
        Ok(Self::new(config.router.clone(), cache, adapters).with_default_interceptors())
    }

    /// Append an interceptor stage.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn QueryInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Append the logging and cache-invalidation stages.
    pub fn with_default_interceptors(self) -> Self {
        let invalidation =
            CacheInvalidationInterceptor::new(self.cache.clone(), self.config.cache_key_prefix.clone());
        self.with_interceptor(Arc::new(LoggingInterceptor))
            .with_interceptor(Arc::new(invalidation))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    /// Execute one query.
    pub async fn query(&self, query: &DatabaseQuery) -> Result<QueryResult, RouterError> {
        query.validate()?;

        let cache_key = self.cache_key_for(query);
        if let Some(key) = &cache_key {
            if let Some(entry) = self.cache.get_json::<QueryResult>(key).await {
                self.tracker.record_cache_hit();
                debug!(key = %key, "serving query from cache");
                let mut result = entry.value;
                result.metadata.cached = true;
                return Ok(result);
            }
            self.tracker.record_cache_miss();
        }

        let selection = self.select(query);
        let adapter = self.resolve(selection)?;
        let ctx = self.context(Operation::Query, selection.provider, query);
        let queries = std::slice::from_ref(query);
        self.run_before(&ctx, queries).await;

        let scoped = self.with_deadline(query);
        let started = Instant::now();
        let outcome = adapter.execute(&scoped).await;

        match outcome {
            Ok(mut result) => {
                let elapsed = result.execution_time_ms;
                result.provider = selection.provider;
                result.metadata.cached = false;
                self.run_after_success(&ctx, queries, elapsed).await;

                if let Some(key) = &cache_key {
                    let ttl = query
                        .options()
                        .cache_ttl
                        .unwrap_or(self.config.default_cache_ttl_secs);
                    self.cache.set_json(key, &result, Some(ttl)).await;
                }

                self.tracker.record(selection.provider, elapsed, false);
                self.tracker.record_shape(QueryShape::of(query), elapsed);
                Ok(result)
            }
            Err(source) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let err = RouterError::adapter(selection.provider, source);
                self.tracker.record(selection.provider, elapsed, true);
                self.run_after_error(&ctx, queries, &err).await;
                Err(err)
            }
        }
    }

    /// Execute queries atomically on the provider chosen for the first one.
    ///
    /// Transactions bypass the cache entirely.
    pub async fn transaction(
        &self,
        queries: &[DatabaseQuery],
        options: &TransactionOptions,
    ) -> Result<TransactionResult, RouterError> {
        let Some(first) = queries.first() else {
            return Err(RouterError::EmptyTransaction);
        };
        for query in queries {
            query.validate()?;
        }

        let selection = self.select(first);
        let adapter = self.resolve(selection)?;
        let ctx = self.context(Operation::Transaction(queries.len()), selection.provider, first);
        self.run_before(&ctx, queries).await;

        let options = TransactionOptions {
            timeout_ms: options.timeout_ms.or(self.config.default_timeout_ms),
            ..options.clone()
        };
        let started = Instant::now();
        let outcome = adapter.execute_transaction(queries, &options).await;

        match outcome {
            Ok(mut result) => {
                let elapsed = result.execution_time_ms;
                result.provider = selection.provider;
                for inner in &mut result.results {
                    inner.provider = selection.provider;
                }
                self.run_after_success(&ctx, queries, elapsed).await;
                self.tracker.record(selection.provider, elapsed, false);
                Ok(result)
            }
            Err(source) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let err = RouterError::adapter(selection.provider, source);
                self.tracker.record(selection.provider, elapsed, true);
                self.run_after_error(&ctx, queries, &err).await;
                Err(err)
            }
        }
    }

    /// Provider the routing rules pick for `query`.
    ///
    /// The result may name a disconnected or unregistered provider when no
    /// rule matched a live adapter; executing such a query fails with
    /// [`RouterError::ProviderUnavailable`].
    pub fn select_adapter(&self, query: &DatabaseQuery) -> ProviderId {
        self.select(query).provider
    }

    /// Routing decision with the rule that produced it.
    pub fn select(&self, query: &DatabaseQuery) -> Selection {
        let selection = selection::select(query, &self.adapters, &self.config);
        debug!(kind = %query.kind(), table = query.table().unwrap_or("-"), %selection, "selected provider");
        selection
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.tracker.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.tracker.reset();
    }

    /// Advisory analysis; never influences routing.
    pub fn analyze(&self, query: &DatabaseQuery) -> QueryAnalysis {
        self.tracker.analyze(query)
    }

    /// Connectivity of every registered provider.
    pub fn health(&self) -> BTreeMap<ProviderId, bool> {
        self.adapters
            .iter()
            .map(|adapter| (adapter.provider(), adapter.is_connected()))
            .collect()
    }

    /// Connect every adapter; failures leave that adapter unavailable.
    pub async fn connect_all(&self) -> Vec<(ProviderId, AdapterError)> {
        self.adapters.connect_all().await
    }

    pub async fn disconnect_all(&self) {
        self.adapters.disconnect_all().await;
    }

    /// `query` carrying the router's default deadline when it has none.
    /// Adapters enforce the deadline so a timed-out call has no effects.
    fn with_deadline<'q>(&self, query: &'q DatabaseQuery) -> Cow<'q, DatabaseQuery> {
        match (query.options().timeout_ms, self.config.default_timeout_ms) {
            (None, Some(ms)) => {
                let mut scoped = query.clone();
                scoped.options_mut().timeout_ms = Some(ms);
                Cow::Owned(scoped)
            }
            _ => Cow::Borrowed(query),
        }
    }

    fn cache_key_for(&self, query: &DatabaseQuery) -> Option<String> {
        if !query.options().use_cache || query.is_write() {
            return None;
        }
        match cache_key(&self.config.cache_key_prefix, query) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "query cannot be cached");
                None
            }
        }
    }

    fn resolve(&self, selection: Selection) -> Result<Arc<dyn DatabaseAdapter>, RouterError> {
        match self.adapters.get(selection.provider) {
            Some(adapter) if adapter.is_connected() => Ok(Arc::clone(adapter)),
            _ => {
                let tried = self.candidates();
                warn!(provider = %selection.provider, ?tried, "no connected provider available");
                Err(RouterError::ProviderUnavailable { tried })
            }
        }
    }

    /// Primary, fallbacks and default, without repeats.
    fn candidates(&self) -> Vec<ProviderId> {
        let mut tried = Vec::with_capacity(self.config.fallbacks.len() + 2);
        let order = std::iter::once(self.config.primary)
            .chain(self.config.fallbacks.iter().copied())
            .chain(std::iter::once(self.config.default_provider));
        for provider in order {
            if !tried.contains(&provider) {
                tried.push(provider);
            }
        }
        tried
    }

    fn context(
        &self,
        operation: Operation,
        provider: ProviderId,
        query: &DatabaseQuery,
    ) -> RequestContext {
        RequestContext {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            operation,
            provider,
            kind: query.kind(),
            table: query.table().map(str::to_string),
        }
    }

    async fn run_before(&self, ctx: &RequestContext, queries: &[DatabaseQuery]) {
        for interceptor in &self.interceptors {
            interceptor.before(ctx, queries).await;
        }
    }

    async fn run_after_success(&self, ctx: &RequestContext, queries: &[DatabaseQuery], ms: u64) {
        for interceptor in &self.interceptors {
            interceptor.after_success(ctx, queries, ms).await;
        }
    }

    async fn run_after_error(&self, ctx: &RequestContext, queries: &[DatabaseQuery], err: &RouterError) {
        for interceptor in &self.interceptors {
            interceptor.after_error(ctx, queries, err).await;
        }
    }
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRouter")
            .field("config", &self.config)
            .field("adapters", &self.adapters)
            .field(
                "interceptors",
                &self.interceptors.iter().map(|i| i.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
