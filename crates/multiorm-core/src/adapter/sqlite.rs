//! SQLite adapter.
//!
//! One rusqlite connection guarded by a mutex; every call runs on the
//! blocking pool. Tables are created on first insert with an
//! `INTEGER PRIMARY KEY AUTOINCREMENT` id and grow a column the first time a
//! field is written. Column kinds that SQLite cannot express (booleans, JSON)
//! are recorded in a metadata table so rows read back with their written type.

use std::collections::{hash_map::Entry, BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use multiorm_proto::{
    DatabaseQuery, DeleteQuery, InsertQuery, IsolationLevel, PaginationInfo, ProviderId,
    QueryResult, RawQuery, Record, SelectQuery, TransactionMetadata, TransactionOptions,
    TransactionResult, UpdateQuery, Value,
};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, TransactionBehavior};
use tracing::{debug, info, warn};

use super::rows::project;
use super::sql::{self, ColumnKind, Fragment};
use super::{check_deadline, AdapterCapabilities, DatabaseAdapter, Deadline};
use crate::config::SqliteConfig;
use crate::error::AdapterError;

/// Records the kind of every non-plain column.
const META_TABLE: &str = "_multiorm_columns";

const BUSY_BACKOFF_MS: u64 = 10;

/// Virtual machine steps between deadline checks.
const PROGRESS_OPS: i32 = 1_000;

#[derive(Debug, Default)]
struct TableSchema {
    columns: BTreeMap<String, ColumnKind>,
}

impl TableSchema {
    fn with_id() -> Self {
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), ColumnKind::Plain);
        Self { columns }
    }

    fn kind_of(&self, column: &str) -> Option<ColumnKind> {
        self.columns.get(column).copied()
    }
}

/// Cached view of the database schema.
#[derive(Debug, Default)]
struct Schema {
    tables: HashMap<String, TableSchema>,
}

struct Session {
    conn: Connection,
    schema: Schema,
}

impl Session {
    fn open(config: &SqliteConfig) -> Result<Self, AdapterError> {
        let conn = match &config.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {META_TABLE} (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (table_name, column_name)
            )"
        ))?;
        let schema = load_schema(&conn)?;
        Ok(Self { conn, schema })
    }

    /// Run one query; writes are wrapped in their own transaction so a
    /// failing batch leaves no partial rows behind.
    fn execute(&mut self, query: &DatabaseQuery, deadline: Option<Deadline>) -> Result<QueryResult, AdapterError> {
        let Session { conn, schema } = self;
        arm(conn, deadline);
        let outcome = if query.is_write() {
            (|| -> Result<QueryResult, AdapterError> {
                let tx = conn.transaction()?;
                let result = run_query(&tx, schema, query)?;
                check_deadline(deadline)?;
                tx.commit()?;
                Ok(result)
            })()
        } else {
            run_query(conn, schema, query)
        };
        disarm(conn);

        let outcome = outcome.map_err(|e| classify(e, deadline));
        if query.is_write() && (outcome.is_err() || query.is_raw()) {
            reload_schema(conn, schema);
        }
        outcome
    }

    /// Run a transaction, retrying on lock contention when allowed.
    /// Returns the results and the number of retries.
    fn transaction(
        &mut self,
        queries: &[DatabaseQuery],
        options: &TransactionOptions,
        deadline: Option<Deadline>,
    ) -> Result<(Vec<QueryResult>, u32), AdapterError> {
        let behavior = match options.isolation_level {
            Some(IsolationLevel::Serializable | IsolationLevel::RepeatableRead) => {
                TransactionBehavior::Immediate
            }
            _ => TransactionBehavior::Deferred,
        };
        let attempts = options.attempts();
        let mut retries = 0;

        loop {
            let Session { conn, schema } = &mut *self;
            arm(conn, deadline);
            let outcome = (|| -> Result<Vec<QueryResult>, AdapterError> {
                let tx = conn.transaction_with_behavior(behavior)?;
                let results = queries
                    .iter()
                    .map(|query| run_query(&tx, schema, query))
                    .collect::<Result<Vec<_>, AdapterError>>()?;
                check_deadline(deadline)?;
                tx.commit()?;
                Ok(results)
            })();
            disarm(conn);

            match outcome.map_err(|e| classify(e, deadline)) {
                Ok(results) => {
                    if queries.iter().any(DatabaseQuery::is_raw) {
                        reload_schema(conn, schema);
                    }
                    return Ok((results, retries));
                }
                Err(err) => {
                    reload_schema(conn, schema);
                    let retryable = matches!(err, AdapterError::Busy(_)) && check_deadline(deadline).is_ok();
                    if retryable && retries + 1 < attempts {
                        retries += 1;
                        warn!(retries, error = %err, "sqlite transaction contended, retrying");
                        std::thread::sleep(Duration::from_millis(BUSY_BACKOFF_MS << retries));
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Interrupt statements still running once `deadline` passes.
fn arm(conn: &Connection, deadline: Option<Deadline>) {
    if let Some(deadline) = deadline {
        let at = deadline.instant();
        conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= at));
    }
}

fn disarm(conn: &Connection) {
    conn.progress_handler(0, None::<fn() -> bool>);
}

/// Map SQLite result codes onto the adapter's error classes. An interrupt
/// only comes from an armed deadline.
fn classify(err: AdapterError, deadline: Option<Deadline>) -> AdapterError {
    match err {
        AdapterError::Sqlite(inner) => match (inner.sqlite_error_code(), deadline) {
            (Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked), _) => {
                AdapterError::Busy(inner.to_string())
            }
            (Some(ErrorCode::ConstraintViolation), _) => AdapterError::Constraint(inner.to_string()),
            (Some(ErrorCode::OperationInterrupted), Some(deadline)) => deadline.timeout(),
            _ => AdapterError::Sqlite(inner),
        },
        other => other,
    }
}

fn load_schema(conn: &Connection) -> Result<Schema, AdapterError> {
    let mut schema = Schema::default();

    let mut tables = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ?1",
    )?;
    let names = tables
        .query_map([META_TABLE], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    for name in names {
        let mut info = conn.prepare(&format!("PRAGMA table_info({})", sql::quote_ident(&name)))?;
        let columns = info
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        schema.tables.insert(
            name,
            TableSchema {
                columns: columns.into_iter().map(|c| (c, ColumnKind::Plain)).collect(),
            },
        );
    }

    let mut kinds = conn.prepare(&format!(
        "SELECT table_name, column_name, kind FROM {META_TABLE}"
    ))?;
    let rows = kinds.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for row in rows {
        let (table, column, kind) = row?;
        if let Some(table) = schema.tables.get_mut(&table) {
            table.columns.insert(column, ColumnKind::parse(&kind));
        }
    }
    Ok(schema)
}

/// Resynchronize the cached schema after a rollback or raw DDL.
fn reload_schema(conn: &Connection, schema: &mut Schema) {
    match load_schema(conn) {
        Ok(fresh) => *schema = fresh,
        Err(e) => warn!(error = %e, "failed to reload sqlite schema"),
    }
}

fn ensure_table<'s>(
    conn: &Connection,
    schema: &'s mut Schema,
    table: &str,
) -> Result<&'s mut TableSchema, AdapterError> {
    if table == META_TABLE {
        return Err(AdapterError::InvalidQuery(format!("table `{table}` is reserved")));
    }
    match schema.tables.entry(table.to_string()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT)",
                sql::quote_ident(table)
            ))?;
            debug!(table, "created sqlite table");
            Ok(entry.insert(TableSchema::with_id()))
        }
    }
}

fn ensure_columns(
    conn: &Connection,
    schema: &mut TableSchema,
    table: &str,
    row: &Record,
) -> Result<(), AdapterError> {
    for (column, value) in row {
        if schema.columns.contains_key(column) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {}",
            sql::quote_ident(table),
            sql::quote_ident(column)
        ))?;
        let kind = ColumnKind::of(value);
        if kind != ColumnKind::Plain {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {META_TABLE} (table_name, column_name, kind) VALUES (?1, ?2, ?3)"
                ),
                params![table, column, kind.as_str()],
            )?;
        }
        schema.columns.insert(column.clone(), kind);
    }
    Ok(())
}

fn read_statement(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[SqlValue],
    table: Option<&TableSchema>,
) -> Result<Vec<Record>, AdapterError> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let kinds: Vec<ColumnKind> = names
        .iter()
        .map(|name| table.and_then(|t| t.kind_of(name)).unwrap_or(ColumnKind::Plain))
        .collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (index, (name, kind)) in names.iter().zip(&kinds).enumerate() {
            record.insert(name.clone(), sql::from_sql(row.get_ref(index)?, *kind));
        }
        records.push(record);
    }
    Ok(records)
}

fn read_rows(
    conn: &Connection,
    stmt: &Fragment,
    table: Option<&TableSchema>,
) -> Result<Vec<Record>, AdapterError> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    read_statement(&mut prepared, &stmt.params, table)
}

fn read_ids(conn: &Connection, stmt: &Fragment) -> Result<Vec<i64>, AdapterError> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    let ids = prepared
        .query_map(params_from_iter(stmt.params.iter()), |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn run_query(
    conn: &Connection,
    schema: &mut Schema,
    query: &DatabaseQuery,
) -> Result<QueryResult, AdapterError> {
    match query {
        DatabaseQuery::Select(q) => select(conn, schema, q),
        DatabaseQuery::Insert(q) => Ok(QueryResult::new(ProviderId::Sqlite, insert(conn, schema, q)?)),
        DatabaseQuery::Update(q) => Ok(QueryResult::new(ProviderId::Sqlite, update(conn, schema, q)?)),
        DatabaseQuery::Delete(q) => Ok(QueryResult::new(ProviderId::Sqlite, delete(conn, schema, q)?)),
        DatabaseQuery::Raw(q) => raw(conn, q),
    }
}

fn select(conn: &Connection, schema: &Schema, query: &SelectQuery) -> Result<QueryResult, AdapterError> {
    if !query.include.is_empty() {
        debug!(table = %query.table, include = ?query.include, "sqlite adapter does not load relations");
    }

    let Some(table) = schema.tables.get(&query.table) else {
        let mut result = QueryResult::new(ProviderId::Sqlite, vec![]).with_total(0);
        if let Some(p) = query.pagination {
            result = result.with_pagination(PaginationInfo::new(p, 0));
        }
        return Ok(result);
    };

    let count = sql::count_sql(&query.table, sql::where_sql(&query.filter, |f| table.kind_of(f)));
    let total = conn.query_row(&count.sql, params_from_iter(count.params.iter()), |row| {
        row.get::<_, i64>(0)
    })? as u64;

    let order = sql::order_sql(&query.order_by, |f| table.columns.contains_key(f));
    let stmt = sql::select_sql(
        &query.table,
        sql::where_sql(&query.filter, |f| table.kind_of(f)),
        &order,
        query.pagination,
    );
    let data = read_rows(conn, &stmt, Some(table))?
        .into_iter()
        .map(|row| project(row, &query.select, &[]))
        .collect();

    let mut result = QueryResult::new(ProviderId::Sqlite, data).with_total(total);
    if let Some(p) = query.pagination {
        result = result.with_pagination(PaginationInfo::new(p, total));
    }
    Ok(result)
}

fn insert(conn: &Connection, schema: &mut Schema, query: &InsertQuery) -> Result<Vec<Record>, AdapterError> {
    let table = ensure_table(conn, schema, &query.table)?;
    let mut ids = Vec::with_capacity(query.data.rows().len());

    for row in query.data.rows() {
        match row.get("id") {
            None | Some(Value::Null) | Some(Value::Int(_)) => {}
            Some(other) => {
                return Err(AdapterError::InvalidQuery(format!(
                    "id must be an integer, got {other:?}"
                )))
            }
        }
        ensure_columns(conn, table, &query.table, row)?;

        let (columns, values): (Vec<&String>, Vec<SqlValue>) = row
            .iter()
            .filter(|(column, value)| !(column.as_str() == "id" && value.is_null()))
            .map(|(column, value)| (column, sql::to_sql(value)))
            .unzip();
        conn.execute(&sql::insert_sql(&query.table, &columns), params_from_iter(values.iter()))?;
        ids.push(conn.last_insert_rowid());
    }

    read_rows(conn, &sql::by_ids_sql(&query.table, &ids), Some(&*table))
}

fn update(conn: &Connection, schema: &mut Schema, query: &UpdateQuery) -> Result<Vec<Record>, AdapterError> {
    let Some(table) = schema.tables.get_mut(&query.table) else {
        return Ok(Vec::new());
    };
    let ids = read_ids(
        conn,
        &sql::ids_sql(&query.table, sql::where_sql(&query.filter, |f| table.kind_of(f))),
    )?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    ensure_columns(conn, table, &query.table, &query.data)?;
    let assignments: Vec<(&String, &Value)> = query.data.iter().collect();
    let stmt = sql::update_sql(&query.table, &assignments, sql::id_filter(&ids));
    conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;

    read_rows(conn, &sql::by_ids_sql(&query.table, &ids), Some(&*table))
}

fn delete(conn: &Connection, schema: &mut Schema, query: &DeleteQuery) -> Result<Vec<Record>, AdapterError> {
    let Some(table) = schema.tables.get(&query.table) else {
        return Ok(Vec::new());
    };
    let matched = read_rows(
        conn,
        &sql::select_sql(
            &query.table,
            sql::where_sql(&query.filter, |f| table.kind_of(f)),
            " ORDER BY \"id\" ASC",
            None,
        ),
        Some(table),
    )?;
    let ids: Vec<i64> = matched
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_i64))
        .collect();
    if !ids.is_empty() {
        let stmt = sql::delete_sql(&query.table, sql::id_filter(&ids));
        conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
    }
    Ok(matched)
}

/// Statements that produce columns return rows; others report the number of
/// changed rows as `total`.
fn raw(conn: &Connection, query: &RawQuery) -> Result<QueryResult, AdapterError> {
    let params: Vec<SqlValue> = query.params.iter().map(sql::to_sql).collect();
    let mut stmt = conn.prepare(&query.sql)?;
    if stmt.column_count() > 0 {
        let rows = read_statement(&mut stmt, &params, None)?;
        return Ok(QueryResult::new(ProviderId::Sqlite, rows));
    }
    let changed = stmt.execute(params_from_iter(params.iter()))?;
    Ok(QueryResult::new(ProviderId::Sqlite, vec![]).with_total(changed as u64))
}

/// Adapter over a single SQLite database.
pub struct SqliteAdapter {
    config: SqliteConfig,
    session: Arc<Mutex<Option<Session>>>,
    connected: AtomicBool,
    executions: AtomicU64,
}

impl std::fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SqliteAdapter {
    pub fn new(config: SqliteConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
            executions: AtomicU64::new(0),
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }

    /// Run `f` against the open session on the blocking pool. Waiting for
    /// the session counts against `deadline`.
    async fn with_session<T, F>(&self, deadline: Option<Deadline>, f: F) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T, AdapterError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut guard = match deadline {
                Some(d) => session.try_lock_until(d.instant()).ok_or_else(|| d.timeout())?,
                None => session.lock(),
            };
            let session = guard.as_mut().ok_or(AdapterError::NotConnected)?;
            f(session)
        })
        .await?
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Sqlite
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            raw_sql: 3,
            relations: 0,
            bulk_insert: 2,
        }
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            return Ok(());
        }
        let config = self.config.clone();
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let opened = Session::open(&config)?;
            *session.lock() = Some(opened);
            Ok::<_, AdapterError>(())
        })
        .await??;

        self.connected.store(true, Ordering::SeqCst);
        info!(
            path = ?self.config.path,
            busy_timeout_ms = self.config.busy_timeout_ms,
            "sqlite adapter connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        let session = Arc::clone(&self.session);
        let closed = tokio::task::spawn_blocking(move || session.lock().take()).await?;
        if let Some(Session { conn, .. }) = closed {
            conn.close().map_err(|(_, e)| AdapterError::Sqlite(e))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn execute(&self, query: &DatabaseQuery) -> Result<QueryResult, AdapterError> {
        self.ensure_connected()?;
        self.executions.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let query = query.clone();
        let deadline = Deadline::from_timeout(query.options().timeout_ms);
        let result = self
            .with_session(deadline, move |session| session.execute(&query, deadline))
            .await?;
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
        let queries = queries.to_vec();
        let opts = options.clone();
        let deadline = Deadline::from_timeout(options.timeout_ms);
        let (results, retries) = self
            .with_session(deadline, move |session| session.transaction(&queries, &opts, deadline))
            .await?;

        Ok(TransactionResult::new(ProviderId::Sqlite, results)
            .with_execution_time(start.elapsed().as_millis() as u64)
            .with_metadata(TransactionMetadata {
                retries,
                rolled_back: retries > 0,
                isolation_level: options.isolation_level,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiorm_proto::{record, Condition, OrderSpec};

    async fn connected() -> SqliteAdapter {
        let adapter = SqliteAdapter::new(SqliteConfig::in_memory());
        adapter.connect().await.unwrap();
        adapter
    }

    fn ids(result: &QueryResult) -> Vec<i64> {
        result
            .data
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_i64))
            .collect()
    }

    #[tokio::test]
    async fn test_insert_creates_table_and_columns() {
        let adapter = connected().await;
        let inserted = adapter
            .execute(
                &InsertQuery::many(
                    "products",
                    vec![
                        record([("name", Value::from("Lamp")), ("active", Value::Bool(true))]),
                        record([("name", Value::from("Mug")), ("tags", vec!["kitchen"].into())]),
                    ],
                )
                .into(),
            )
            .await
            .unwrap();
        assert_eq!(ids(&inserted), vec![1, 2]);

        let all = adapter
            .execute(&DatabaseQuery::select("products").into())
            .await
            .unwrap();
        assert_eq!(all.data[0]["active"], Value::Bool(true));
        assert_eq!(all.data[1]["active"], Value::Null);
        assert_eq!(all.data[1]["tags"], Value::from(vec!["kitchen"]));
    }

    #[tokio::test]
    async fn test_select_filters_orders_and_pages() {
        let adapter = connected().await;
        let rows = (1..=25)
            .map(|i| record([("n", Value::Int(i)), ("even", Value::Bool(i % 2 == 0))]))
            .collect();
        adapter
            .execute(&InsertQuery::many("numbers", rows).into())
            .await
            .unwrap();

        let page = adapter
            .execute(&DatabaseQuery::select("numbers").page(2, 10).into())
            .await
            .unwrap();
        assert_eq!(ids(&page), (11..=20).collect::<Vec<_>>());
        assert_eq!(page.total, Some(25));
        assert_eq!(page.pagination.unwrap().total_pages, 3);

        let filtered = adapter
            .execute(
                &DatabaseQuery::select("numbers")
                    .filter("even", true)
                    .condition("n", Condition::ops().gt(10).lte(16))
                    .order_by(OrderSpec::desc("n"))
                    .fields(["n"])
                    .into(),
            )
            .await
            .unwrap();
        let ns: Vec<_> = filtered.data.iter().map(|r| r["n"].clone()).collect();
        assert_eq!(ns, vec![Value::Int(16), Value::Int(14), Value::Int(12)]);
        assert_eq!(filtered.data[0].len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_table_and_column() {
        let adapter = connected().await;
        let empty = adapter
            .execute(&DatabaseQuery::select("nothing").page(1, 5).into())
            .await
            .unwrap();
        assert!(empty.data.is_empty());
        assert_eq!(empty.total, Some(0));

        adapter
            .execute(&InsertQuery::one("t", record([("a", 1)])).into())
            .await
            .unwrap();
        let none = adapter
            .execute(&DatabaseQuery::select("t").filter("b", 1).into())
            .await
            .unwrap();
        assert!(none.data.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_return_rows() {
        let adapter = connected().await;
        adapter
            .execute(
                &InsertQuery::many("items", vec![record([("qty", 1)]), record([("qty", 5)])]).into(),
            )
            .await
            .unwrap();

        let updated = adapter
            .execute(
                &UpdateQuery::new("items", record([("label", "big")]))
                    .condition("qty", Condition::ops().gte(5))
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(ids(&updated), vec![2]);
        assert_eq!(updated.data[0]["label"], Value::from("big"));

        let deleted = adapter
            .execute(&DeleteQuery::new("items").filter("qty", 1).into())
            .await
            .unwrap();
        assert_eq!(ids(&deleted), vec![1]);

        let left = adapter
            .execute(&DatabaseQuery::select("items").into())
            .await
            .unwrap();
        assert_eq!(ids(&left), vec![2]);
    }

    #[tokio::test]
    async fn test_raw_statements() {
        let adapter = connected().await;
        let created = adapter
            .execute(&RawQuery::new("CREATE TABLE kv (k TEXT, v INTEGER)").into())
            .await
            .unwrap();
        assert_eq!(created.total, Some(0));

        let inserted = adapter
            .execute(
                &RawQuery::new("INSERT INTO kv VALUES (?1, ?2), (?3, ?4)")
                    .params([Value::from("a"), Value::Int(1), Value::from("b"), Value::Int(2)])
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(inserted.total, Some(2));

        let rows = adapter
            .execute(&RawQuery::new("SELECT k, v FROM kv WHERE v > ?1").params([1]).into())
            .await
            .unwrap();
        assert_eq!(rows.data, vec![record([("k", Value::from("b")), ("v", Value::Int(2))])]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rolls_back_transaction() {
        let adapter = connected().await;
        let queries: Vec<DatabaseQuery> = vec![
            InsertQuery::one("users", record([("id", 1)])).into(),
            InsertQuery::one("users", record([("id", 2), ("extra", 1)])).into(),
            InsertQuery::one("users", record([("id", 1)])).into(),
        ];
        let err = adapter
            .execute_transaction(&queries, &TransactionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Constraint(_)));

        let users = adapter
            .execute(&DatabaseQuery::select("users").into())
            .await
            .unwrap();
        assert!(users.data.is_empty());

        // The rolled back ALTER TABLE must not linger in the cached schema
        let again = adapter
            .execute(&InsertQuery::one("users", record([("extra", 7)])).into())
            .await
            .unwrap();
        assert_eq!(again.data[0]["extra"], Value::Int(7));
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multiorm.db");

        let adapter = SqliteAdapter::new(SqliteConfig::file(&path));
        adapter.connect().await.unwrap();
        adapter
            .execute(&InsertQuery::one("notes", record([("done", false)])).into())
            .await
            .unwrap();
        adapter.disconnect().await.unwrap();
        assert!(matches!(
            adapter.execute(&DatabaseQuery::select("notes").into()).await,
            Err(AdapterError::NotConnected)
        ));

        let reopened = SqliteAdapter::new(SqliteConfig::file(&path));
        reopened.connect().await.unwrap();
        let notes = reopened
            .execute(&DatabaseQuery::select("notes").into())
            .await
            .unwrap();
        assert_eq!(notes.data[0]["done"], Value::Bool(false));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_and_rolls_back() {
        let adapter = connected().await;
        let mut queries: Vec<DatabaseQuery> = vec![
            InsertQuery::one("orders", record([("n", 1)])).into(),
            RawQuery::new(
                "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 1000000000) \
                 SELECT count(*) FROM c",
            )
            .into(),
        ];
        let err = adapter
            .execute_transaction(&queries, &TransactionOptions::default().with_timeout_ms(30))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(30)), "{err:?}");

        // The handler is gone once the call returns
        queries.truncate(1);
        adapter
            .execute_transaction(&queries, &TransactionOptions::default())
            .await
            .unwrap();
        let orders = adapter
            .execute(&DatabaseQuery::select("orders").into())
            .await
            .unwrap();
        assert_eq!(ids(&orders), vec![1]);
    }
}
