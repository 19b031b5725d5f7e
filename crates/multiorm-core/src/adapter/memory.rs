//! In-process adapter.
//!
//! Tables live in a `BTreeMap` behind one lock. Transactions run against a
//! cloned snapshot that replaces the live tables only when every query
//! succeeded. This adapter is the one that loads relations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use multiorm_proto::{
    DatabaseQuery, DeleteQuery, InsertQuery, ProviderId, QueryResult, Record, SelectQuery,
    TransactionMetadata, TransactionOptions, TransactionResult, UpdateQuery, Value,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::relations::load_includes;
use super::rows::{self, row_id};
use super::{check_deadline, AdapterCapabilities, DatabaseAdapter, Deadline};
use crate::config::MemoryConfig;
use crate::error::AdapterError;

#[derive(Debug, Clone)]
struct Table {
    rows: Vec<Record>,
    next_id: i64,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            next_id: 1,
        }
    }
}

type Tables = BTreeMap<String, Table>;

/// Adapter over process memory.
#[derive(Debug)]
pub struct MemoryAdapter {
    name: String,
    tables: RwLock<Tables>,
    connected: AtomicBool,
    available: AtomicBool,
    executions: AtomicU64,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            name: config.name.unwrap_or_else(|| "memory".to_string()),
            tables: RwLock::new(Tables::new()),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            executions: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: an unavailable adapter disconnects and refuses to
    /// reconnect until made available again.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Insert rows directly, bypassing the connection state.
    pub fn seed(&self, table: &str, rows: Vec<Record>) -> Result<Vec<Record>, AdapterError> {
        let query = InsertQuery::many(table, rows);
        insert(&mut self.tables.write(), &query)
    }

    /// Snapshot of a table's rows in stored order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of queries and transactions this adapter has executed.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }

    fn read_tables(&self, deadline: Option<Deadline>) -> Result<RwLockReadGuard<'_, Tables>, AdapterError> {
        match deadline {
            Some(d) => self.tables.try_read_until(d.instant()).ok_or_else(|| d.timeout()),
            None => Ok(self.tables.read()),
        }
    }

    fn write_tables(&self, deadline: Option<Deadline>) -> Result<RwLockWriteGuard<'_, Tables>, AdapterError> {
        match deadline {
            Some(d) => self.tables.try_write_until(d.instant()).ok_or_else(|| d.timeout()),
            None => Ok(self.tables.write()),
        }
    }

    fn run(&self, query: &DatabaseQuery, deadline: Option<Deadline>) -> Result<QueryResult, AdapterError> {
        match query {
            DatabaseQuery::Select(q) => select(&*self.read_tables(deadline)?, q),
            DatabaseQuery::Raw(_) => Err(unsupported_raw()),
            write => {
                let mut tables = self.write_tables(deadline)?;
                check_deadline(deadline)?;
                apply(&mut tables, write)
            }
        }
    }

    fn run_transaction(
        &self,
        queries: &[DatabaseQuery],
        deadline: Option<Deadline>,
    ) -> Result<Vec<QueryResult>, AdapterError> {
        let mut live = self.write_tables(deadline)?;
        let mut scratch = live.clone();
        let results = queries
            .iter()
            .map(|query| apply(&mut scratch, query))
            .collect::<Result<Vec<_>, _>>()?;
        check_deadline(deadline)?;
        *live = scratch;
        Ok(results)
    }
}

#[async_trait]
impl DatabaseAdapter for MemoryAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Memory
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            raw_sql: 0,
            relations: 3,
            bulk_insert: 1,
        }
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AdapterError::NotConnected);
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(name = %self.name, "memory adapter connected");
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
        self.ensure_connected()?;
        self.executions.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let deadline = Deadline::from_timeout(query.options().timeout_ms);
        let result = self.run(query, deadline)?;
        Ok(result.with_execution_time(start.elapsed().as_millis() as u64))
    }

    async fn execute_transaction(
        &self,
        queries: &[DatabaseQuery],
        options: &TransactionOptions,
    ) -> Result<TransactionResult, AdapterError> {
        self.ensure_connected()?;
        self.executions.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let deadline = Deadline::from_timeout(options.timeout_ms);
        let results = self.run_transaction(queries, deadline)?;
        Ok(TransactionResult::new(ProviderId::Memory, results)
            .with_execution_time(start.elapsed().as_millis() as u64)
            .with_metadata(TransactionMetadata {
                retries: 0,
                rolled_back: false,
                isolation_level: options.isolation_level,
            }))
    }
}

fn unsupported_raw() -> AdapterError {
    AdapterError::Unsupported("raw SQL is not supported by the memory adapter".into())
}

fn apply(tables: &mut Tables, query: &DatabaseQuery) -> Result<QueryResult, AdapterError> {
    let rows = match query {
        DatabaseQuery::Select(q) => return select(tables, q),
        DatabaseQuery::Insert(q) => insert(tables, q)?,
        DatabaseQuery::Update(q) => update(tables, q),
        DatabaseQuery::Delete(q) => delete(tables, q),
        DatabaseQuery::Raw(_) => return Err(unsupported_raw()),
    };
    Ok(QueryResult::new(ProviderId::Memory, rows))
}

fn select(tables: &Tables, query: &SelectQuery) -> Result<QueryResult, AdapterError> {
    let stored = tables.get(&query.table).map(|t| t.rows.clone()).unwrap_or_default();
    let mut selection = rows::select(stored, query);

    if !query.include.is_empty() {
        load_includes(
            tables,
            |t: &Table| t.rows.as_slice(),
            &query.table,
            &mut selection.rows,
            &query.include,
        )?;
    }

    let data = selection
        .rows
        .into_iter()
        .map(|row| rows::project(row, &query.select, &query.include))
        .collect();
    let mut result = QueryResult::new(ProviderId::Memory, data).with_total(selection.total);
    if let Some(info) = selection.pagination {
        result = result.with_pagination(info);
    }
    Ok(result)
}

fn insert(tables: &mut Tables, query: &InsertQuery) -> Result<Vec<Record>, AdapterError> {
    let table = tables.entry(query.table.clone()).or_default();
    let mut next_id = table.next_id;
    let mut staged: Vec<Record> = Vec::with_capacity(query.data.rows().len());

    for row in query.data.rows() {
        let id = match row.get("id") {
            None | Some(Value::Null) => next_id,
            Some(Value::Int(id)) => *id,
            Some(other) => {
                return Err(AdapterError::InvalidQuery(format!(
                    "id must be an integer, got {other:?}"
                )))
            }
        };
        let taken = |r: &Record| row_id(r) == Some(id);
        if table.rows.iter().any(taken) || staged.iter().any(taken) {
            return Err(AdapterError::Constraint(format!(
                "duplicate id {id} in `{}`",
                query.table
            )));
        }
        next_id = next_id.max(id + 1);

        let mut stored = row.clone();
        stored.insert("id".to_string(), Value::Int(id));
        staged.push(stored);
    }

    table.rows.extend(staged.iter().cloned());
    table.next_id = next_id;
    Ok(staged)
}

fn update(tables: &mut Tables, query: &UpdateQuery) -> Vec<Record> {
    let Some(table) = tables.get_mut(&query.table) else {
        return Vec::new();
    };
    table
        .rows
        .iter_mut()
        .filter(|row| rows::FilterEvaluator::matches(&query.filter, row))
        .map(|row| {
            rows::apply_patch(row, &query.data);
            row.clone()
        })
        .collect()
}

fn delete(tables: &mut Tables, query: &DeleteQuery) -> Vec<Record> {
    let Some(table) = tables.get_mut(&query.table) else {
        return Vec::new();
    };
    let (removed, kept): (Vec<Record>, Vec<Record>) = std::mem::take(&mut table.rows)
        .into_iter()
        .partition(|row| rows::FilterEvaluator::matches(&query.filter, row));
    table.rows = kept;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiorm_proto::{record, Condition, RawQuery};

    async fn connected() -> MemoryAdapter {
        let adapter = MemoryAdapter::new();
        adapter.connect().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let adapter = MemoryAdapter::new();
        let err = adapter
            .execute(&DatabaseQuery::select("t").into())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected));
        assert_eq!(adapter.executions(), 0);
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_from_one() {
        let adapter = connected().await;
        let result = adapter
            .execute(
                &InsertQuery::many("users", vec![record([("name", "a")]), record([("name", "b")])])
                    .into(),
            )
            .await
            .unwrap();
        let ids: Vec<_> = result.data.iter().filter_map(row_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(result.total, Some(2));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_constraint_error() {
        let adapter = connected().await;
        adapter.seed("users", vec![record([("id", 5)])]).unwrap();
        let err = adapter
            .execute(&InsertQuery::one("users", record([("id", 5)])).into())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Constraint(_)));

        // Explicit ids move the sequence forward
        let next = adapter
            .execute(&InsertQuery::one("users", record([("name", "x")])).into())
            .await
            .unwrap();
        assert_eq!(row_id(&next.data[0]), Some(6));
    }

    #[tokio::test]
    async fn test_update_and_delete_return_rows() {
        let adapter = connected().await;
        adapter
            .seed(
                "items",
                vec![record([("qty", 1)]), record([("qty", 5)]), record([("qty", 9)])],
            )
            .unwrap();

        let updated = adapter
            .execute(
                &UpdateQuery::new("items", record([("flag", true)]))
                    .condition("qty", Condition::ops().gt(2))
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(updated.data.len(), 2);
        assert!(updated.data.iter().all(|r| r["flag"] == Value::Bool(true)));

        let deleted = adapter
            .execute(&DeleteQuery::new("items").filter("flag", true).into())
            .await
            .unwrap();
        assert_eq!(deleted.data.len(), 2);
        assert_eq!(adapter.rows("items").len(), 1);
    }

    #[tokio::test]
    async fn test_select_with_include_and_projection() {
        let adapter = connected().await;
        adapter
            .seed("customers", vec![record([("name", "Ada")])])
            .unwrap();
        adapter
            .seed(
                "orders",
                vec![record([("customer_id", 1), ("total", 10)])],
            )
            .unwrap();

        let result = adapter
            .execute(
                &DatabaseQuery::select("orders")
                    .fields(["total"])
                    .include("customer")
                    .into(),
            )
            .await
            .unwrap();
        let row = &result.data[0];
        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["customer", "total"]);
        assert_eq!(
            row["customer"].as_object().unwrap()["name"],
            Value::String("Ada".into())
        );
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let adapter = connected().await;
        let queries: Vec<DatabaseQuery> = vec![
            InsertQuery::one("users", record([("id", 1)])).into(),
            InsertQuery::one("users", record([("id", 2)])).into(),
            InsertQuery::one("users", record([("id", 1)])).into(),
        ];
        let err = adapter
            .execute_transaction(&queries, &TransactionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Constraint(_)));
        assert!(adapter.rows("users").is_empty());

        let ok = adapter
            .execute_transaction(&queries[..2], &TransactionOptions::default())
            .await
            .unwrap();
        assert_eq!(ok.results.len(), 2);
        assert_eq!(adapter.rows("users").len(), 2);
    }

    #[tokio::test]
    async fn test_raw_is_unsupported() {
        let adapter = connected().await;
        let err = adapter
            .execute(&RawQuery::new("SELECT 1").into())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_expired_deadline_changes_nothing() {
        let adapter = connected().await;
        let queries: Vec<DatabaseQuery> = vec![
            InsertQuery::one("users", record([("id", 1)])).into(),
            InsertQuery::one("users", record([("id", 2)])).into(),
        ];
        let err = adapter
            .execute_transaction(&queries, &TransactionOptions::default().with_timeout_ms(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(0)));

        let mut insert = queries[0].clone();
        insert.options_mut().timeout_ms = Some(0);
        assert!(matches!(
            adapter.execute(&insert).await,
            Err(AdapterError::Timeout(0))
        ));
        assert!(adapter.rows("users").is_empty());
    }
}
