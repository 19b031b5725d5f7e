//! SQL generation and value mapping for the SQLite adapter.
//!
//! Every identifier is quoted and every value is bound as a parameter; no
//! user data is ever spliced into statement text.

use multiorm_proto::{Condition, ConditionOps, OrderBy, OrderDirection, Pagination, Value, WhereClause};
use rusqlite::types::{Value as SqlValue, ValueRef};

/// Logical type of a column, recorded so values read back with the type they
/// were written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Stored natively (null, integer, real, text).
    Plain,
    /// Stored as 0/1.
    Bool,
    /// Arrays and objects, stored as JSON text.
    Json,
}

impl ColumnKind {
    /// Kind implied by the first value written to a new column.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Bool(_) => ColumnKind::Bool,
            Value::Array(_) | Value::Object(_) => ColumnKind::Json,
            _ => ColumnKind::Plain,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Plain => "plain",
            ColumnKind::Bool => "bool",
            ColumnKind::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "bool" => ColumnKind::Bool,
            "json" => ColumnKind::Json,
            _ => ColumnKind::Plain,
        }
    }
}

/// Quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Convert a value into a bindable SQLite value.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            SqlValue::Text(serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()))
        }
    }
}

/// Convert a stored SQLite value back, honouring the column kind.
pub fn from_sql(value: ValueRef<'_>, kind: ColumnKind) -> Value {
    match (value, kind) {
        (ValueRef::Null, _) => Value::Null,
        (ValueRef::Integer(i), ColumnKind::Bool) => Value::Bool(i != 0),
        (ValueRef::Integer(i), _) => Value::Int(i),
        (ValueRef::Real(f), _) => Value::Float(f),
        (ValueRef::Text(bytes), kind) => {
            let text = String::from_utf8_lossy(bytes);
            if kind == ColumnKind::Json {
                if let Ok(decoded) = serde_json::from_str::<Value>(&text) {
                    return decoded;
                }
            }
            Value::String(text.into_owned())
        }
        (ValueRef::Blob(bytes), _) => {
            Value::Array(bytes.iter().map(|b| Value::Int(i64::from(*b))).collect())
        }
    }
}

/// SQL fragment plus its bound parameters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Fragment {
    fn push(&mut self, other: Fragment) {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
    }
}

/// Predicate that never matches.
const NEVER: &str = "0";

fn type_guard(bound: &Value) -> Option<&'static str> {
    match bound {
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Some("IN ('integer', 'real')"),
        Value::String(_) => Some("= 'text'"),
        _ => None,
    }
}

fn comparison(column: &str, op: &str, bound: &Value, out: &mut Vec<String>, params: &mut Vec<SqlValue>) {
    match type_guard(bound) {
        Some(guard) => {
            out.push(format!("(typeof({column}) {guard} AND {column} {op} ?)"));
            params.push(to_sql(bound));
        }
        None => out.push(NEVER.to_string()),
    }
}

fn ops_predicates(
    column: &str,
    kind: ColumnKind,
    ops: &ConditionOps,
    out: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
) {
    let bounds = [(&ops.gte, ">="), (&ops.lte, "<="), (&ops.gt, ">"), (&ops.lt, "<")];
    for (bound, op) in bounds {
        if let Some(bound) = bound {
            comparison(column, op, bound, out, params);
        }
    }

    if let Some(values) = &ops.one_of {
        if values.is_empty() {
            out.push(NEVER.to_string());
        } else {
            let marks = vec!["?"; values.len()].join(", ");
            out.push(format!("{column} IN ({marks})"));
            params.extend(values.iter().map(to_sql));
        }
    }

    if let Some(needle) = &ops.contains {
        match (kind, needle) {
            (ColumnKind::Json, _) => {
                out.push(format!(
                    "EXISTS (SELECT 1 FROM json_each({column}) WHERE json_each.value = ?)"
                ));
                params.push(to_sql(needle));
            }
            (_, Value::String(s)) => {
                out.push(format!("(typeof({column}) = 'text' AND instr({column}, ?) > 0)"));
                params.push(SqlValue::Text(s.clone()));
            }
            _ => out.push(NEVER.to_string()),
        }
    }
}

/// Build ` WHERE ...` for a where clause; empty when there are no conditions.
///
/// `kind_of` reports the kind of a known column. A condition on an unknown
/// column matches nothing, except equality with null.
pub fn where_sql(filter: &WhereClause, kind_of: impl Fn(&str) -> Option<ColumnKind>) -> Fragment {
    let mut predicates = Vec::new();
    let mut params = Vec::new();

    for (field, condition) in filter {
        let Some(kind) = kind_of(field) else {
            if !matches!(condition, Condition::Eq(Value::Null)) {
                predicates.push(NEVER.to_string());
            }
            continue;
        };
        let column = quote_ident(field);
        match condition {
            Condition::Eq(Value::Null) => predicates.push(format!("{column} IS NULL")),
            Condition::Eq(value) => {
                predicates.push(format!("{column} = ?"));
                params.push(to_sql(value));
            }
            Condition::Ops(ops) => ops_predicates(&column, kind, ops, &mut predicates, &mut params),
        }
    }

    if predicates.is_empty() {
        return Fragment::default();
    }
    Fragment {
        sql: format!(" WHERE {}", predicates.join(" AND ")),
        params,
    }
}

/// Build ` ORDER BY ...`, skipping unknown columns and ending with `id` so
/// ties keep insertion order.
pub fn order_sql(order_by: &OrderBy, known: impl Fn(&str) -> bool) -> String {
    let mut keys: Vec<String> = order_by
        .iter()
        .filter(|spec| spec.field == "id" || known(&spec.field))
        .map(|spec| {
            let dir = match spec.direction {
                OrderDirection::Asc => "ASC",
                OrderDirection::Desc => "DESC",
            };
            format!("{} {dir}", quote_ident(&spec.field))
        })
        .collect();
    if !order_by.iter().any(|spec| spec.field == "id") {
        keys.push(format!("{} ASC", quote_ident("id")));
    }
    format!(" ORDER BY {}", keys.join(", "))
}

/// `SELECT *` with filter, order, and optional page.
pub fn select_sql(
    table: &str,
    filter: Fragment,
    order: &str,
    pagination: Option<Pagination>,
) -> Fragment {
    let mut stmt = Fragment {
        sql: format!("SELECT * FROM {}", quote_ident(table)),
        params: vec![],
    };
    stmt.push(filter);
    stmt.sql.push_str(order);
    if let Some(p) = pagination {
        stmt.sql.push_str(" LIMIT ? OFFSET ?");
        stmt.params.push(SqlValue::Integer(i64::from(p.limit)));
        stmt.params.push(SqlValue::Integer(p.offset() as i64));
    }
    stmt
}

/// `SELECT COUNT(*)` with filter.
pub fn count_sql(table: &str, filter: Fragment) -> Fragment {
    let mut stmt = Fragment {
        sql: format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        params: vec![],
    };
    stmt.push(filter);
    stmt
}

/// `SELECT "id"` with filter, in id order.
pub fn ids_sql(table: &str, filter: Fragment) -> Fragment {
    let mut stmt = Fragment {
        sql: format!("SELECT \"id\" FROM {}", quote_ident(table)),
        params: vec![],
    };
    stmt.push(filter);
    stmt.sql.push_str(" ORDER BY \"id\"");
    stmt
}

pub fn insert_sql(table: &str, columns: &[&String]) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
    }
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let marks = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({marks})",
        quote_ident(table),
        names.join(", ")
    )
}

/// `UPDATE ... SET` with the assignments' parameters before the filter's.
pub fn update_sql(table: &str, assignments: &[(&String, &Value)], filter: Fragment) -> Fragment {
    let sets: Vec<String> = assignments
        .iter()
        .map(|(column, _)| format!("{} = ?", quote_ident(column)))
        .collect();
    let mut stmt = Fragment {
        sql: format!("UPDATE {} SET {}", quote_ident(table), sets.join(", ")),
        params: assignments.iter().map(|(_, value)| to_sql(value)).collect(),
    };
    stmt.push(filter);
    stmt
}

pub fn delete_sql(table: &str, filter: Fragment) -> Fragment {
    let mut stmt = Fragment {
        sql: format!("DELETE FROM {}", quote_ident(table)),
        params: vec![],
    };
    stmt.push(filter);
    stmt
}

/// ` WHERE "id" IN (...)`; matches nothing for an empty list.
pub fn id_filter(ids: &[i64]) -> Fragment {
    if ids.is_empty() {
        return Fragment {
            sql: format!(" WHERE {NEVER}"),
            params: vec![],
        };
    }
    let marks = vec!["?"; ids.len()].join(", ");
    Fragment {
        sql: format!(" WHERE \"id\" IN ({marks})"),
        params: ids.iter().map(|id| SqlValue::Integer(*id)).collect(),
    }
}

/// `SELECT *` for an explicit id list, in id order.
pub fn by_ids_sql(table: &str, ids: &[i64]) -> Fragment {
    select_sql(table, id_filter(ids), " ORDER BY \"id\" ASC", None)
}
