//! Sled adapter.
//!
//! Each table is a sled tree named `table:{name}` keyed by the row id as a
//! big-endian `u64`, so tree order is id order. Rows are stored as JSON.
//!
//! Writers are serialized by a gate lock. A single query commits its changes
//! with one `Batch`; a transaction stages every change in an overlay that
//! later queries of the same transaction read through, then commits all
//! touched trees in one multi-tree sled transaction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use multiorm_proto::{
    DatabaseQuery, InsertQuery, ProviderId, QueryResult, Record, TransactionMetadata,
    TransactionOptions, TransactionResult, Value,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Batch, Db, Transactional, Tree};
use tracing::{debug, info};

use super::rows::{self, FilterEvaluator};
use super::{check_deadline, AdapterCapabilities, DatabaseAdapter, Deadline};
use crate::config::SledConfig;
use crate::error::AdapterError;

const TREE_PREFIX: &str = "table:";

/// Pending writes of one table: id to new row, `None` for a delete.
type TableWrites = BTreeMap<u64, Option<Record>>;

/// Pending writes of a transaction, by table.
type Overlay = BTreeMap<String, TableWrites>;

fn encode_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_key(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

struct SledInner {
    config: SledConfig,
    db: RwLock<Option<Db>>,
    trees: DashMap<String, Tree>,
    /// Held shared by readers, exclusively by writers.
    gate: RwLock<()>,
}

impl SledInner {
    fn db(&self) -> Result<Db, AdapterError> {
        self.db.read().clone().ok_or(AdapterError::NotConnected)
    }

    fn tree(&self, db: &Db, table: &str) -> Result<Tree, AdapterError> {
        if let Some(tree) = self.trees.get(table) {
            return Ok(tree.clone());
        }
        let tree = db.open_tree(format!("{TREE_PREFIX}{table}"))?;
        self.trees.insert(table.to_string(), tree.clone());
        Ok(tree)
    }

    /// Current rows of a table by id, with staged writes applied.
    fn load(&self, db: &Db, table: &str, overlay: &Overlay) -> Result<BTreeMap<u64, Record>, AdapterError> {
        let tree = self.tree(db, table)?;
        let mut rows = BTreeMap::new();
        for item in tree.iter() {
            let (key, value) = item?;
            let Some(id) = decode_key(&key) else {
                continue;
            };
            rows.insert(id, serde_json::from_slice::<Record>(&value)?);
        }
        if let Some(writes) = overlay.get(table) {
            for (id, write) in writes {
                match write {
                    Some(row) => rows.insert(*id, row.clone()),
                    None => rows.remove(id),
                };
            }
        }
        Ok(rows)
    }

    /// Evaluate a query against stored rows plus `overlay`, returning its
    /// result and the writes it implies.
    fn plan(
        &self,
        db: &Db,
        query: &DatabaseQuery,
        overlay: &Overlay,
    ) -> Result<(QueryResult, Option<(String, TableWrites)>), AdapterError> {
        match query {
            DatabaseQuery::Select(q) => {
                if !q.include.is_empty() {
                    debug!(table = %q.table, include = ?q.include, "sled adapter does not load relations");
                }
                let stored = self.load(db, &q.table, overlay)?;
                let selection = rows::select(stored.into_values(), q);
                let data = selection
                    .rows
                    .into_iter()
                    .map(|row| rows::project(row, &q.select, &[]))
                    .collect();
                let mut result = QueryResult::new(ProviderId::Sled, data).with_total(selection.total);
                if let Some(info) = selection.pagination {
                    result = result.with_pagination(info);
                }
                Ok((result, None))
            }
            DatabaseQuery::Insert(q) => {
                let stored = self.load(db, &q.table, overlay)?;
                let writes = plan_insert(&stored, q)?;
                let inserted = writes.values().flatten().cloned().collect();
                Ok((
                    QueryResult::new(ProviderId::Sled, inserted),
                    Some((q.table.clone(), writes)),
                ))
            }
            DatabaseQuery::Update(q) => {
                let stored = self.load(db, &q.table, overlay)?;
                let mut writes = TableWrites::new();
                for (id, mut row) in stored {
                    if FilterEvaluator::matches(&q.filter, &row) {
                        rows::apply_patch(&mut row, &q.data);
                        writes.insert(id, Some(row));
                    }
                }
                let updated = writes.values().flatten().cloned().collect();
                Ok((
                    QueryResult::new(ProviderId::Sled, updated),
                    Some((q.table.clone(), writes)),
                ))
            }
            DatabaseQuery::Delete(q) => {
                let stored = self.load(db, &q.table, overlay)?;
                let mut writes = TableWrites::new();
                let mut removed = Vec::new();
                for (id, row) in stored {
                    if FilterEvaluator::matches(&q.filter, &row) {
                        writes.insert(id, None);
                        removed.push(row);
                    }
                }
                Ok((
                    QueryResult::new(ProviderId::Sled, removed),
                    Some((q.table.clone(), writes)),
                ))
            }
            DatabaseQuery::Raw(_) => Err(AdapterError::Unsupported(
                "raw SQL is not supported by the sled adapter".into(),
            )),
        }
    }

    fn read_gate(&self, deadline: Option<Deadline>) -> Result<RwLockReadGuard<'_, ()>, AdapterError> {
        match deadline {
            Some(d) => self.gate.try_read_until(d.instant()).ok_or_else(|| d.timeout()),
            None => Ok(self.gate.read()),
        }
    }

    fn write_gate(&self, deadline: Option<Deadline>) -> Result<RwLockWriteGuard<'_, ()>, AdapterError> {
        match deadline {
            Some(d) => self.gate.try_write_until(d.instant()).ok_or_else(|| d.timeout()),
            None => Ok(self.gate.write()),
        }
    }

    fn execute(&self, query: &DatabaseQuery, deadline: Option<Deadline>) -> Result<QueryResult, AdapterError> {
        let db = self.db()?;
        if !query.is_write() {
            let _read = self.read_gate(deadline)?;
            return self.plan(&db, query, &Overlay::new()).map(|(result, _)| result);
        }

        let _write = self.write_gate(deadline)?;
        let (result, writes) = self.plan(&db, query, &Overlay::new())?;
        if let Some((table, writes)) = writes {
            let mut batch = Batch::default();
            for (id, write) in &writes {
                match write {
                    Some(row) => batch.insert(encode_key(*id).to_vec(), serde_json::to_vec(row)?),
                    None => batch.remove(encode_key(*id).to_vec()),
                }
            }
            let tree = self.tree(&db, &table)?;
            check_deadline(deadline)?;
            tree.apply_batch(batch)?;
            self.flush_if_needed(&db)?;
        }
        Ok(result)
    }

    fn transaction(
        &self,
        queries: &[DatabaseQuery],
        deadline: Option<Deadline>,
    ) -> Result<Vec<QueryResult>, AdapterError> {
        let db = self.db()?;
        let _write = self.write_gate(deadline)?;

        let mut overlay = Overlay::new();
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            check_deadline(deadline)?;
            let (result, writes) = self.plan(&db, query, &overlay)?;
            if let Some((table, writes)) = writes {
                overlay.entry(table).or_default().extend(writes);
            }
            results.push(result);
        }

        self.commit(&db, overlay, deadline)?;
        Ok(results)
    }

    /// Apply staged writes to every touched tree atomically.
    /// The deadline is checked once everything is encoded, right before the
    /// sled transaction; nothing is written when it has passed.
    fn commit(&self, db: &Db, overlay: Overlay, deadline: Option<Deadline>) -> Result<(), AdapterError> {
        if overlay.is_empty() {
            return Ok(());
        }

        let mut trees = Vec::with_capacity(overlay.len());
        let mut encoded: Vec<Vec<([u8; 8], Option<Vec<u8>>)>> = Vec::with_capacity(overlay.len());
        for (table, writes) in &overlay {
            trees.push(self.tree(db, table)?);
            let ops = writes
                .iter()
                .map(|(id, write)| {
                    let value = write.as_ref().map(serde_json::to_vec).transpose()?;
                    Ok::<_, AdapterError>((encode_key(*id), value))
                })
                .collect::<Result<Vec<_>, AdapterError>>()?;
            encoded.push(ops);
        }
        check_deadline(deadline)?;

        let outcome = trees.as_slice().transaction(|txs| -> ConflictableTransactionResult<(), AdapterError> {
            for (tx, ops) in txs.iter().zip(&encoded) {
                for (key, value) in ops {
                    match value {
                        Some(bytes) => tx.insert(&key[..], bytes.as_slice())?,
                        None => tx.remove(&key[..])?,
                    };
                }
            }
            Ok(())
        });

        match outcome {
            Ok(()) => self.flush_if_needed(db),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(AdapterError::Storage(e)),
        }
    }

    fn flush_if_needed(&self, db: &Db) -> Result<(), AdapterError> {
        if self.config.flush_every_ms.is_none() {
            db.flush()?;
        }
        Ok(())
    }
}

/// Assign ids (last id + 1 when absent) and reject duplicates.
fn plan_insert(stored: &BTreeMap<u64, Record>, query: &InsertQuery) -> Result<TableWrites, AdapterError> {
    let mut next_id = stored.keys().next_back().map_or(1, |last| last + 1);
    let mut writes = TableWrites::new();

    for row in query.data.rows() {
        let id = match row.get("id") {
            None | Some(Value::Null) => next_id,
            Some(Value::Int(id)) if *id > 0 => *id as u64,
            Some(other) => {
                return Err(AdapterError::InvalidQuery(format!(
                    "id must be a positive integer, got {other:?}"
                )))
            }
        };
        if stored.contains_key(&id) || writes.contains_key(&id) {
            return Err(AdapterError::Constraint(format!(
                "duplicate id {id} in `{}`",
                query.table
            )));
        }
        next_id = next_id.max(id + 1);

        let mut stored_row = row.clone();
        stored_row.insert("id".to_string(), Value::Int(id as i64));
        writes.insert(id, Some(stored_row));
    }
    Ok(writes)
}

/// Adapter over an embedded sled database.
pub struct SledAdapter {
    inner: Arc<SledInner>,
    executions: AtomicU64,
}

impl std::fmt::Debug for SledAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledAdapter")
            .field("config", &self.inner.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SledAdapter {
    pub fn new(config: SledConfig) -> Self {
        Self {
            inner: Arc::new(SledInner {
                config,
                db: RwLock::new(None),
                trees: DashMap::new(),
                gate: RwLock::new(()),
            }),
            executions: AtomicU64::new(0),
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(&SledInner) -> Result<T, AdapterError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(inner.as_ref())).await?
    }
}

#[async_trait]
impl DatabaseAdapter for SledAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Sled
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            raw_sql: 0,
            relations: 0,
            bulk_insert: 3,
        }
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            return Ok(());
        }
        self.blocking(|inner| {
            let db = inner.config.to_sled_config().open()?;
            info!(
                path = ?inner.config.path,
                recovered = db.was_recovered(),
                "sled adapter connected"
            );
            *inner.db.write() = Some(db);
            Ok(())
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.blocking(|inner| {
            let _write = inner.gate.write();
            inner.trees.clear();
            if let Some(db) = inner.db.write().take() {
                db.flush()?;
            }
            Ok(())
        })
        .await
    }

    fn is_connected(&self) -> bool {
        self.inner.db.read().is_some()
    }

    async fn execute(&self, query: &DatabaseQuery) -> Result<QueryResult, AdapterError> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        self.executions.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let query = query.clone();
        let deadline = Deadline::from_timeout(query.options().timeout_ms);
        let result = self
            .blocking(move |inner| inner.execute(&query, deadline))
            .await?;
        Ok(result.with_execution_time(start.elapsed().as_millis() as u64))
    }

    async fn execute_transaction(
        &self,
        queries: &[DatabaseQuery],
        options: &TransactionOptions,
    ) -> Result<TransactionResult, AdapterError> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        self.executions.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let queries = queries.to_vec();
        let deadline = Deadline::from_timeout(options.timeout_ms);
        let results = self
            .blocking(move |inner| inner.transaction(&queries, deadline))
            .await?;
        Ok(TransactionResult::new(ProviderId::Sled, results)
            .with_execution_time(start.elapsed().as_millis() as u64)
            .with_metadata(TransactionMetadata {
                retries: 0,
                rolled_back: false,
                isolation_level: options.isolation_level,
            }))
    }
}
