//! Interceptor pipeline composed around router entry points.
//!
//! Interceptors run in registration order: `before` once the provider is
//! chosen, then exactly one of `after_success` or `after_error`. Cache hits
//! and requests rejected before selection never reach them. Performance
//! tracking is not an interceptor; the router always records it last.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use multiorm_proto::{DatabaseQuery, ProviderId, QueryKind};
use tracing::{debug, error, info};

use super::cache_key::{prefix_pattern, table_pattern};
use crate::cache::CacheStore;
use crate::error::RouterError;

/// Entry point a request came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Query,
    /// Transaction with this many sub-queries.
    Transaction(usize),
}

/// Per-request facts shared with every interceptor.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Process-unique, increasing request id.
    pub request_id: u64,
    pub operation: Operation,
    pub provider: ProviderId,
    /// Kind of the (first) query.
    pub kind: QueryKind,
    pub table: Option<String>,
}

/// A stage around adapter execution.
#[async_trait]
pub trait QueryInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(&self, _ctx: &RequestContext, _queries: &[DatabaseQuery]) {}

    async fn after_success(
        &self,
        _ctx: &RequestContext,
        _queries: &[DatabaseQuery],
        _execution_time_ms: u64,
    ) {
    }

    async fn after_error(
        &self,
        _ctx: &RequestContext,
        _queries: &[DatabaseQuery],
        _error: &RouterError,
    ) {
    }
}

/// Emits one event per request stage. Never logs field values.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

#[async_trait]
impl QueryInterceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn before(&self, ctx: &RequestContext, _queries: &[DatabaseQuery]) {
        debug!(
            request_id = ctx.request_id,
            provider = %ctx.provider,
            kind = %ctx.kind,
            table = ctx.table.as_deref().unwrap_or("-"),
            operation = ?ctx.operation,
            "dispatching request"
        );
    }

    async fn after_success(
        &self,
        ctx: &RequestContext,
        _queries: &[DatabaseQuery],
        execution_time_ms: u64,
    ) {
        debug!(
            request_id = ctx.request_id,
            provider = %ctx.provider,
            elapsed_ms = execution_time_ms,
            "request completed"
        );
    }

    async fn after_error(&self, ctx: &RequestContext, _queries: &[DatabaseQuery], err: &RouterError) {
        error!(
            request_id = ctx.request_id,
            provider = %ctx.provider,
            kind = %ctx.kind,
            table = ctx.table.as_deref().unwrap_or("-"),
            retryable = err.is_retryable(),
            error = %err,
            "request failed"
        );
    }
}

/// Drops cached query results a successful write may have made stale.
///
/// A write to a table removes `{prefix}:{table}:*`. A raw write that names
/// no table could have touched anything, so it removes `{prefix}:*`.
pub struct CacheInvalidationInterceptor {
    cache: Arc<dyn CacheStore>,
    prefix: String,
}

impl CacheInvalidationInterceptor {
    pub fn new(cache: Arc<dyn CacheStore>, prefix: impl Into<String>) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
        }
    }

    /// Patterns to clear after `queries` succeeded.
    pub fn patterns(&self, queries: &[DatabaseQuery]) -> BTreeSet<String> {
        let mut patterns = BTreeSet::new();
        for query in queries.iter().filter(|q| q.is_write()) {
            match query.table() {
                Some(table) => patterns.insert(table_pattern(&self.prefix, Some(table))),
                None => patterns.insert(prefix_pattern(&self.prefix)),
            };
        }
        if patterns.contains(&prefix_pattern(&self.prefix)) {
            patterns.retain(|p| *p == prefix_pattern(&self.prefix));
        }
        patterns
    }

    /// Remove every entry matching the patterns; returns the count removed.
    pub async fn invalidate(&self, queries: &[DatabaseQuery]) -> u64 {
        let mut removed = 0;
        for pattern in self.patterns(queries) {
            let keys = self.cache.keys(Some(&pattern)).await;
            if !keys.is_empty() {
                removed += self.cache.mdel(&keys).await;
            }
        }
        removed
    }
}

#[async_trait]
impl QueryInterceptor for CacheInvalidationInterceptor {
    fn name(&self) -> &'static str {
        "cache-invalidation"
    }

    async fn after_success(
        &self,
        ctx: &RequestContext,
        queries: &[DatabaseQuery],
        _execution_time_ms: u64,
    ) {
        let removed = self.invalidate(queries).await;
        if removed > 0 {
            info!(
                request_id = ctx.request_id,
                table = ctx.table.as_deref().unwrap_or("-"),
                removed,
                "invalidated cached results"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use multiorm_proto::{record, InsertQuery, RawQuery, UpdateQuery};

    fn interceptor() -> (Arc<MemoryCacheStore>, CacheInvalidationInterceptor) {
        let cache = Arc::new(MemoryCacheStore::new(100, 60));
        let interceptor = CacheInvalidationInterceptor::new(cache.clone(), "q");
        (cache, interceptor)
    }

    #[test]
    fn test_patterns() {
        let (_, interceptor) = interceptor();
        let read: DatabaseQuery = DatabaseQuery::select("products").into();
        let insert: DatabaseQuery = InsertQuery::one("products", record([("a", 1)])).into();
        let update: DatabaseQuery =
            UpdateQuery::new("orders", record([("a", 2)])).filter("id", 1).into();

        assert!(interceptor.patterns(&[read.clone()]).is_empty());
        let patterns: Vec<String> = interceptor
            .patterns(&[read, insert, update])
            .into_iter()
            .collect();
        assert_eq!(patterns, vec!["q:orders:*", "q:products:*"]);

        let untabled: DatabaseQuery = RawQuery::new("DELETE FROM x").into();
        let tabled: DatabaseQuery = RawQuery::new("DELETE FROM y").on_table("y").into();
        let patterns: Vec<String> =
            interceptor.patterns(&[tabled, untabled]).into_iter().collect();
        assert_eq!(patterns, vec!["q:*"]);

        let raw_read: DatabaseQuery = RawQuery::new("SELECT * FROM x").into();
        assert!(interceptor.patterns(&[raw_read]).is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_removes_only_matching_table() {
        let (cache, interceptor) = interceptor();
        cache.set("q:products:aa", b"1".to_vec(), None).await;
        cache.set("q:products:bb", b"2".to_vec(), None).await;
        cache.set("q:orders:cc", b"3".to_vec(), None).await;

        let insert: DatabaseQuery = InsertQuery::one("products", record([("a", 1)])).into();
        assert_eq!(interceptor.invalidate(&[insert]).await, 2);
        assert!(!cache.exists("q:products:aa").await);
        assert!(cache.exists("q:orders:cc").await);
    }
}
