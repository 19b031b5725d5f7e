//! Integration tests for the query router.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multiorm_core::adapter::{
    AdapterCapabilities, AdapterSet, DatabaseAdapter, MemoryAdapter, SledAdapter, SqliteAdapter,
};
use multiorm_core::cache::{build_cache_store, CacheStore, ManualClock, MemoryCacheStore};
use multiorm_core::config::{CacheConfig, CompressionConfig, RouterConfig, SledConfig, SqliteConfig};
use multiorm_core::error::{AdapterError, RouterError};
use multiorm_core::router::QueryRouter;
use multiorm_proto::{
    record, Condition, DatabaseQuery, DeleteQuery, InsertQuery, ProviderId, QueryOptions,
    QueryResult, RawQuery, Record, TransactionOptions, TransactionResult, UpdateQuery, Value,
};

/// Adapter that answers every query after a fixed delay, or gives up with a
/// timeout when the query's deadline is shorter.
struct FixedLatencyAdapter {
    provider: ProviderId,
    latency_ms: u64,
    connected: AtomicBool,
    calls: AtomicU64,
}

impl FixedLatencyAdapter {
    fn new(provider: ProviderId, latency_ms: u64) -> Self {
        Self {
            provider,
            latency_ms,
            connected: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl DatabaseAdapter for FixedLatencyAdapter {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn execute(&self, query: &DatabaseQuery) -> Result<QueryResult, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ms) = query.options().timeout_ms.filter(|ms| *ms < self.latency_ms) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Err(AdapterError::Timeout(ms));
        }
        tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        Ok(QueryResult::new(self.provider, vec![record([("ok", true)])])
            .with_execution_time(self.latency_ms))
    }

    async fn execute_transaction(
        &self,
        queries: &[DatabaseQuery],
        _options: &TransactionOptions,
    ) -> Result<TransactionResult, AdapterError> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.execute(query).await?);
        }
        Ok(TransactionResult::new(self.provider, results))
    }
}

fn products() -> Vec<Record> {
    let mut rows: Vec<Record> = (1..=25)
        .map(|n| {
            record([
                ("n", Value::Int(n)),
                ("category", "Electronics".into()),
                ("price", Value::Int(n * 2)),
            ])
        })
        .collect();
    for n in 26..=30 {
        rows.insert(
            ((n - 26) * 5) as usize,
            record([
                ("n", Value::Int(n)),
                ("category", "Books".into()),
                ("price", Value::Int(n)),
            ]),
        );
    }
    rows
}

async fn all_adapters() -> (AdapterSet, Arc<MemoryAdapter>, Arc<SqliteAdapter>, Arc<SledAdapter>) {
    let memory = Arc::new(MemoryAdapter::new());
    let sqlite = Arc::new(SqliteAdapter::new(SqliteConfig::in_memory()));
    let sled = Arc::new(SledAdapter::new(SledConfig::temporary()));
    let set = AdapterSet::new()
        .with(sqlite.clone())
        .with(sled.clone())
        .with(memory.clone());
    assert!(set.connect_all().await.is_empty());
    (set, memory, sqlite, sled)
}

fn memory_cache() -> Arc<MemoryCacheStore> {
    Arc::new(MemoryCacheStore::new(1_000, 3_600))
}

async fn seed(adapter: &dyn DatabaseAdapter, table: &str, rows: Vec<Record>) {
    adapter
        .execute(&InsertQuery::many(table, rows).into())
        .await
        .unwrap();
}

fn numbers(result: &QueryResult) -> Vec<i64> {
    result
        .data
        .iter()
        .map(|row| row["n"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_second_page_of_filtered_products_on_every_provider() {
    for provider in ProviderId::ALL {
        let (set, ..) = all_adapters().await;
        seed(set.get(provider).unwrap().as_ref(), "products", products()).await;
        let router = QueryRouter::new(
            RouterConfig::new(provider),
            memory_cache(),
            set,
        );

        let query: DatabaseQuery = DatabaseQuery::select("products")
            .filter("category", "Electronics")
            .page(2, 10)
            .into();
        let result = router.query(&query).await.unwrap();

        assert_eq!(result.provider, provider);
        assert_eq!(numbers(&result), (11..=20).collect::<Vec<_>>(), "{provider}");
        assert_eq!(result.total, Some(25));
        let pagination = result.pagination.unwrap();
        assert_eq!(pagination.total_pages, 3);
        assert!(pagination.has_next);
        assert!(pagination.has_prev);
    }
}

#[tokio::test]
async fn test_multiple_operators_on_one_field_are_a_conjunction() {
    for provider in ProviderId::ALL {
        let (set, ..) = all_adapters().await;
        seed(set.get(provider).unwrap().as_ref(), "products", products()).await;
        let router = QueryRouter::new(RouterConfig::new(provider), memory_cache(), set);

        let query: DatabaseQuery = DatabaseQuery::select("products")
            .filter("category", "Electronics")
            .condition("price", Condition::ops().gte(10).lte(20))
            .into();
        let result = router.query(&query).await.unwrap();

        assert_eq!(numbers(&result), (5..=10).collect::<Vec<_>>(), "{provider}");
    }
}

#[tokio::test]
async fn test_raw_sql_routes_to_sqlite_regardless_of_primary() {
    let (set, memory, sqlite, _) = all_adapters().await;
    let config = RouterConfig::new(ProviderId::Memory).with_fallbacks([ProviderId::Sled]);
    let router = QueryRouter::new(config, memory_cache(), set);

    let raw: DatabaseQuery = RawQuery::new("SELECT 1 AS one").into();
    for _ in 0..5 {
        assert_eq!(router.select_adapter(&raw), ProviderId::Sqlite);
    }
    let result = router.query(&raw).await.unwrap();
    assert_eq!(result.provider, ProviderId::Sqlite);
    assert_eq!(result.data[0]["one"], Value::Int(1));
    assert_eq!(memory.executions(), 0);
    assert_eq!(sqlite.executions(), 1);
}

#[tokio::test]
async fn test_fallback_when_primary_disconnected() {
    let (set, memory, sqlite, sled) = all_adapters().await;
    sqlite.disconnect().await.unwrap();
    sled.disconnect().await.unwrap();
    let config = RouterConfig::new(ProviderId::Sqlite)
        .with_fallbacks([ProviderId::Sled, ProviderId::Memory]);
    let router = QueryRouter::new(config, memory_cache(), set);

    let query: DatabaseQuery = DatabaseQuery::select("products").into();
    let result = router.query(&query).await.unwrap();
    assert_eq!(result.provider, ProviderId::Memory);
    assert_eq!(memory.executions(), 1);
}

#[tokio::test]
async fn test_no_connected_provider_is_unavailable_and_unrecorded() {
    let (set, memory, sqlite, sled) = all_adapters().await;
    sqlite.disconnect().await.unwrap();
    sled.disconnect().await.unwrap();
    memory.disconnect().await.unwrap();
    let config = RouterConfig::new(ProviderId::Sqlite)
        .with_fallbacks([ProviderId::Sled, ProviderId::Memory]);
    let router = QueryRouter::new(config, memory_cache(), set);

    let err = router
        .query(&DatabaseQuery::select("products").into())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::ProviderUnavailable { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.status_code(), 503);
    assert_eq!(router.metrics().total_queries, 0);
}

#[tokio::test]
async fn test_unregistered_default_is_unavailable() {
    let memory = Arc::new(MemoryAdapter::new());
    let set = AdapterSet::new().with(memory.clone());
    let router = QueryRouter::new(RouterConfig::new(ProviderId::Memory), memory_cache(), set);
    // Never connected.
    let err = router
        .query(&DatabaseQuery::select("t").into())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::ProviderUnavailable { .. }));
    assert_eq!(router.metrics().total_queries, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_keep_exact_metrics() {
    const LATENCY_MS: u64 = 5;
    let adapter = Arc::new(FixedLatencyAdapter::new(ProviderId::Memory, LATENCY_MS));
    let set = AdapterSet::new().with(adapter.clone());
    let router = Arc::new(QueryRouter::new(
        RouterConfig::new(ProviderId::Memory),
        memory_cache(),
        set,
    ));
    router.connect_all().await;

    let handles: Vec<_> = (0..1000)
        .map(|_| {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                router
                    .query(&DatabaseQuery::select("items").into())
                    .await
                    .map(|result| result.provider)
            })
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        assert_eq!(result.unwrap().unwrap(), ProviderId::Memory);
    }

    let metrics = router.metrics();
    assert_eq!(metrics.total_queries, 1000);
    assert_eq!(metrics.average_execution_time_ms, LATENCY_MS as f64);
    assert_eq!(metrics.error_rate, 0.0);
    let usage = metrics.provider_usage[&ProviderId::Memory];
    assert_eq!(usage.queries, 1000);
    assert_eq!(usage.average_time_ms, LATENCY_MS as f64);
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1000);
}

#[tokio::test]
async fn test_timeout_is_retryable_adapter_error() {
    let adapter = Arc::new(FixedLatencyAdapter::new(ProviderId::Sled, 500));
    let router = QueryRouter::new(
        RouterConfig::new(ProviderId::Sled),
        memory_cache(),
        AdapterSet::new().with(adapter),
    );
    router.connect_all().await;

    let query: DatabaseQuery = DatabaseQuery::select("slow")
        .with_options(QueryOptions::default().with_timeout_ms(20))
        .into();
    let err = router.query(&query).await.unwrap_err();

    match &err {
        RouterError::AdapterExecution {
            provider,
            retryable,
            source,
        } => {
            assert_eq!(*provider, ProviderId::Sled);
            assert!(*retryable);
            assert!(matches!(source, AdapterError::Timeout(20)));
        }
        other => panic!("expected adapter error, got {other:?}"),
    }
    let metrics = router.metrics();
    assert_eq!(metrics.total_queries, 1);
    assert_eq!(metrics.provider_usage[&ProviderId::Sled].errors, 1);
}

/// Counts to a billion; only an interrupt ends it early.
const LONG_COUNT: &str = "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 1000000000) \
     SELECT count(*) AS n FROM c";

fn sqlite_router(config: RouterConfig) -> (QueryRouter, Arc<SqliteAdapter>) {
    let sqlite = Arc::new(SqliteAdapter::new(SqliteConfig::in_memory()));
    let router = QueryRouter::new(config, memory_cache(), AdapterSet::new().with(sqlite.clone()));
    (router, sqlite)
}

#[tokio::test]
async fn test_timed_out_transaction_commits_nothing() {
    let (router, _) = sqlite_router(RouterConfig::new(ProviderId::Sqlite));
    router.connect_all().await;

    let queries: Vec<DatabaseQuery> = vec![
        InsertQuery::one("orders", record([("n", 1)])).into(),
        RawQuery::new(LONG_COUNT).into(),
    ];
    let started = std::time::Instant::now();
    let err = router
        .transaction(&queries, &TransactionOptions::default().with_timeout_ms(50))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5), "statement was not interrupted");
    assert!(
        matches!(
            err,
            RouterError::AdapterExecution {
                retryable: true,
                source: AdapterError::Timeout(50),
                ..
            }
        ),
        "{err:?}"
    );

    // Nothing may land after the error was reported
    tokio::time::sleep(Duration::from_millis(200)).await;
    let orders = router
        .query(&DatabaseQuery::select("orders").into())
        .await
        .unwrap();
    assert!(orders.data.is_empty());
    assert_eq!(router.metrics().provider_usage[&ProviderId::Sqlite].errors, 1);
}

#[tokio::test]
async fn test_default_deadline_applies_to_single_writes() {
    let (router, _) =
        sqlite_router(RouterConfig::new(ProviderId::Sqlite).with_default_timeout_ms(50));
    router.connect_all().await;
    router
        .query(&RawQuery::new("CREATE TABLE kv (x INTEGER)").into())
        .await
        .unwrap();

    let slow_insert: DatabaseQuery = RawQuery::new(
        "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 1000000000) \
         INSERT INTO kv SELECT n FROM c",
    )
    .on_table("kv")
    .into();
    let err = router.query(&slow_insert).await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");

    let count = router
        .query(&RawQuery::new("SELECT count(*) AS n FROM kv").into())
        .await
        .unwrap();
    assert_eq!(count.data[0]["n"], Value::Int(0));
}

#[tokio::test]
async fn test_cached_cte_write_runs_every_time() {
    let (router, sqlite) = sqlite_router(RouterConfig::new(ProviderId::Sqlite));
    router.connect_all().await;
    router
        .query(&RawQuery::new("CREATE TABLE kv (x INTEGER)").into())
        .await
        .unwrap();

    let mut write: DatabaseQuery =
        RawQuery::new("WITH s(x) AS (SELECT 1) INSERT INTO kv SELECT x FROM s").into();
    *write.options_mut() = QueryOptions::cached();
    let first = router.query(&write).await.unwrap();
    let second = router.query(&write).await.unwrap();
    assert!(!first.metadata.cached);
    assert!(!second.metadata.cached);

    let count = router
        .query(&RawQuery::new("SELECT count(*) AS n FROM kv").into())
        .await
        .unwrap();
    assert_eq!(count.data[0]["n"], Value::Int(2));
    assert_eq!(sqlite.executions(), 4);
}

#[tokio::test]
async fn test_uncached_queries_always_execute() {
    let (set, memory, ..) = all_adapters().await;
    let cache = memory_cache();
    let router = QueryRouter::new(RouterConfig::new(ProviderId::Memory), cache.clone(), set);

    let query: DatabaseQuery = DatabaseQuery::select("products").into();
    router.query(&query).await.unwrap();
    router.query(&query).await.unwrap();

    assert_eq!(memory.executions(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_cached_result_expires_with_ttl() {
    let (set, memory, ..) = all_adapters().await;
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = Arc::new(MemoryCacheStore::new(100, 3_600).with_clock(clock.clone()));
    let router = QueryRouter::new(RouterConfig::new(ProviderId::Memory), cache.clone(), set);

    let query: DatabaseQuery = DatabaseQuery::select("products")
        .with_options(QueryOptions::default().with_cache_ttl(1))
        .into();
    router.query(&query).await.unwrap();
    assert!(router.query(&query).await.unwrap().metadata.cached);
    assert_eq!(memory.executions(), 1);

    clock.advance(Duration::from_millis(1_001));
    let refreshed = router.query(&query).await.unwrap();
    assert!(!refreshed.metadata.cached);
    assert_eq!(memory.executions(), 2);
}

#[tokio::test]
async fn test_semantically_identical_queries_share_cache_entry() {
    let (set, memory, ..) = all_adapters().await;
    let router = QueryRouter::new(RouterConfig::new(ProviderId::Memory), memory_cache(), set);

    let a = DatabaseQuery::from_json(
        r#"{"type":"select","table":"products","where":{"category":"Electronics","price":{"gte":10,"lte":20}},"options":{"useCache":true}}"#,
    )
    .unwrap();
    let b = DatabaseQuery::from_json(
        r#"{"options":{"useCache":true,"cacheTtl":60},"where":{"price":{"lte":20,"gte":10},"category":"Electronics"},"table":"products","type":"select"}"#,
    )
    .unwrap();

    router.query(&a).await.unwrap();
    assert!(router.query(&b).await.unwrap().metadata.cached);
    assert_eq!(memory.executions(), 1);
}

#[tokio::test]
async fn test_compressed_encrypted_cache_round_trip() {
    let (set, memory, ..) = all_adapters().await;
    seed(memory.as_ref(), "products", products()).await;
    let cache = build_cache_store(
        &CacheConfig::memory(100)
            .with_compression(CompressionConfig {
                level: 6,
                min_size: 16,
            })
            .with_encryption("correct horse battery staple"),
    )
    .unwrap();
    let router = QueryRouter::new(RouterConfig::new(ProviderId::Memory), cache, set);

    let query: DatabaseQuery = DatabaseQuery::select("products")
        .with_options(QueryOptions::cached())
        .into();
    let first = router.query(&query).await.unwrap();
    let second = router.query(&query).await.unwrap();

    assert!(second.metadata.cached);
    assert_eq!(second.data, first.data);
    assert_eq!(second.len(), 30);
    assert_eq!(memory.executions(), 2); // seed + first query
}

#[tokio::test]
async fn test_writes_invalidate_cached_reads() {
    let (set, _, sqlite, _) = all_adapters().await;
    seed(sqlite.as_ref(), "products", products()).await;
    let cache = memory_cache();
    let router = QueryRouter::new(RouterConfig::new(ProviderId::Sqlite), cache.clone(), set)
        .with_default_interceptors();

    let read: DatabaseQuery = DatabaseQuery::select("products")
        .filter("category", "Books")
        .with_options(QueryOptions::cached())
        .into();
    assert_eq!(router.query(&read).await.unwrap().len(), 5);

    let update: DatabaseQuery = UpdateQuery::new("products", record([("category", "Books")]))
        .filter("n", 1)
        .into();
    router.query(&update).await.unwrap();
    assert!(cache.keys(Some("multiorm:query:products:*")).await.is_empty());

    let after = router.query(&read).await.unwrap();
    assert!(!after.metadata.cached);
    assert_eq!(after.len(), 6);
}

async fn assert_failed_transaction_leaves_no_trace(provider: ProviderId) {
    let (set, ..) = all_adapters().await;
    let adapter = Arc::clone(set.get(provider).unwrap());
    seed(adapter.as_ref(), "accounts", vec![
        record([("id", Value::Int(1)), ("balance", Value::Int(100))]),
        record([("id", Value::Int(2)), ("balance", Value::Int(50))]),
    ])
    .await;
    let router = QueryRouter::new(RouterConfig::new(provider), memory_cache(), set);

    let queries: Vec<DatabaseQuery> = vec![
        UpdateQuery::new("accounts", record([("balance", 70)]))
            .filter("id", 1)
            .into(),
        InsertQuery::one("accounts", record([("id", Value::Int(3)), ("balance", Value::Int(30))]))
            .into(),
        // Duplicate primary key.
        InsertQuery::one("accounts", record([("id", Value::Int(2)), ("balance", Value::Int(0))]))
            .into(),
    ];
    let err = router
        .transaction(&queries, &TransactionOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RouterError::AdapterExecution { provider: p, .. } if p == provider),
        "{provider}: {err:?}"
    );

    let rows = router
        .query(&DatabaseQuery::select("accounts").into())
        .await
        .unwrap();
    let balances: Vec<(i64, i64)> = rows
        .data
        .iter()
        .map(|row| (row["id"].as_i64().unwrap(), row["balance"].as_i64().unwrap()))
        .collect();
    assert_eq!(balances, vec![(1, 100), (2, 50)], "{provider}");

    let metrics = router.metrics();
    assert_eq!(metrics.total_queries, 2);
    assert_eq!(metrics.provider_usage[&provider].errors, 1);
}

#[tokio::test]
async fn test_failed_transaction_rolls_back_on_every_provider() {
    for provider in ProviderId::ALL {
        assert_failed_transaction_leaves_no_trace(provider).await;
    }
}

#[tokio::test]
async fn test_successful_transaction() {
    let (set, memory, ..) = all_adapters().await;
    let router = QueryRouter::new(RouterConfig::new(ProviderId::Memory), memory_cache(), set);

    let queries: Vec<DatabaseQuery> = vec![
        InsertQuery::one("orders", record([("total", 10)])).into(),
        InsertQuery::one("orders", record([("total", 20)])).into(),
        DeleteQuery::new("orders")
            .condition("total", Condition::ops().lt(15))
            .into(),
    ];
    let result = router
        .transaction(&queries, &TransactionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.provider, ProviderId::Memory);
    assert_eq!(result.results.len(), 3);
    assert_eq!(result.results[2].len(), 1);
    assert_eq!(memory.rows("orders").len(), 1);
    assert_eq!(router.metrics().total_queries, 1);
}

#[tokio::test]
async fn test_transaction_routes_by_first_query() {
    let (set, _, sqlite, _) = all_adapters().await;
    let router = QueryRouter::new(RouterConfig::new(ProviderId::Memory), memory_cache(), set);

    let queries: Vec<DatabaseQuery> = vec![
        RawQuery::new("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)").into(),
        RawQuery::new("INSERT INTO notes (body) VALUES (?)")
            .params(["hi"])
            .on_table("notes")
            .into(),
    ];
    let result = router
        .transaction(&queries, &TransactionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.provider, ProviderId::Sqlite);
    assert_eq!(result.results[1].total, Some(1));
    assert_eq!(sqlite.executions(), 1);
}
