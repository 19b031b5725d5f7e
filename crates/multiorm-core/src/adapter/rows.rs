//! In-process evaluation of select semantics over decoded rows.
//!
//! The sled and memory adapters keep rows as [`Record`]s and share this code
//! for filtering, ordering, pagination, and projection, so both agree on the
//! result of the same query.

use std::cmp::Ordering;

use multiorm_proto::{
    Condition, ConditionOps, OrderBy, OrderDirection, Pagination, PaginationInfo, Record,
    SelectQuery, Value, WhereClause,
};

/// Evaluates where clauses against rows.
pub struct FilterEvaluator;

impl FilterEvaluator {
    /// True when the row satisfies every condition. Missing fields read as null.
    pub fn matches(filter: &WhereClause, row: &Record) -> bool {
        filter.iter().all(|(field, condition)| {
            let value = row.get(field).unwrap_or(&Value::Null);
            Self::evaluate(condition, value)
        })
    }

    /// Evaluate one field condition against a value.
    pub fn evaluate(condition: &Condition, value: &Value) -> bool {
        match condition {
            Condition::Eq(expected) => Self::values_equal(value, expected),
            Condition::Ops(ops) => Self::evaluate_ops(ops, value),
        }
    }

    fn evaluate_ops(ops: &ConditionOps, value: &Value) -> bool {
        let ordered = |bound: &Option<Value>, accept: fn(Ordering) -> bool| match bound {
            Some(bound) => Self::compare_values(value, bound).is_some_and(accept),
            None => true,
        };

        ordered(&ops.gte, Ordering::is_ge)
            && ordered(&ops.lte, Ordering::is_le)
            && ordered(&ops.gt, Ordering::is_gt)
            && ordered(&ops.lt, Ordering::is_lt)
            && ops
                .one_of
                .as_ref()
                .map_or(true, |set| set.iter().any(|v| Self::values_equal(value, v)))
            && ops
                .contains
                .as_ref()
                .map_or(true, |needle| Self::contains(value, needle))
    }

    /// Check if two values are equal (numbers compare across int and float).
    pub fn values_equal(a: &Value, b: &Value) -> bool {
        a.loose_eq(b)
    }

    /// Compare two values; `None` when the types are not comparable.
    pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
        a.compare(b)
    }

    /// Substring match on strings, membership on arrays.
    pub fn contains(haystack: &Value, needle: &Value) -> bool {
        match (haystack, needle) {
            (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| item.loose_eq(needle)),
            _ => false,
        }
    }
}

/// Stable sort by the order keys; rows that tie keep their stored order.
pub fn sort_rows(rows: &mut [Record], order_by: &OrderBy) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for spec in order_by.iter() {
            let left = a.get(&spec.field).unwrap_or(&Value::Null);
            let right = b.get(&spec.field).unwrap_or(&Value::Null);
            let ord = match spec.direction {
                OrderDirection::Asc => left.sort_cmp(right),
                OrderDirection::Desc => right.sort_cmp(left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Slice out one page.
pub fn paginate(rows: Vec<Record>, pagination: Pagination) -> Vec<Record> {
    rows.into_iter()
        .skip(pagination.offset())
        .take(pagination.limit as usize)
        .collect()
}

/// Keep only `fields` (plus `keep`, used for loaded relations).
pub fn project(mut row: Record, fields: &[String], keep: &[String]) -> Record {
    if fields.is_empty() {
        return row;
    }
    row.retain(|name, _| fields.contains(name) || keep.contains(name));
    row
}

/// Overwrite the row's fields with `patch`.
pub fn apply_patch(row: &mut Record, patch: &Record) {
    for (field, value) in patch {
        row.insert(field.clone(), value.clone());
    }
}

/// Rows surviving filter, order, and pagination, with the pre-pagination count.
#[derive(Debug, Default)]
pub struct Selection {
    pub rows: Vec<Record>,
    pub total: u64,
    pub pagination: Option<PaginationInfo>,
}

/// Run the filter/order/paginate part of a select. Projection is left to the
/// caller so that relation loading can still see foreign keys.
pub fn select(rows: impl IntoIterator<Item = Record>, query: &SelectQuery) -> Selection {
    let mut matched: Vec<Record> = rows
        .into_iter()
        .filter(|row| FilterEvaluator::matches(&query.filter, row))
        .collect();
    sort_rows(&mut matched, &query.order_by);

    let total = matched.len() as u64;
    match query.pagination {
        Some(p) => Selection {
            rows: paginate(matched, p),
            total,
            pagination: Some(PaginationInfo::new(p, total)),
        },
        None => Selection {
            rows: matched,
            total,
            pagination: None,
        },
    }
}

/// The row's integer id, if it has one.
pub fn row_id(row: &Record) -> Option<i64> {
    row.get("id").and_then(Value::as_i64)
}
