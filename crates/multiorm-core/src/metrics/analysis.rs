//! Heuristic query analysis.
//!
//! Scores are advisory. The router never consults them when choosing a
//! provider; they exist for operators and tooling.

use multiorm_proto::{Condition, DatabaseQuery, WhereClause};
use serde::{Deserialize, Serialize};

use super::shape::QueryShape;
use super::tracker::ShapeStats;

/// Baseline cost of one complexity point in milliseconds, used when a shape
/// has no history.
const MS_PER_COMPLEXITY_POINT: f64 = 2.0;

/// `in` lists longer than this are flagged.
const LARGE_IN_LIST: usize = 100;

/// Bulk inserts larger than this are flagged.
const LARGE_BATCH: usize = 1_000;

/// Outcome of [`analyze`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    /// Structural fingerprint, hex encoded.
    pub shape: String,
    /// Grows with predicates, includes, ordering and unbounded reads.
    pub complexity_score: u32,
    /// 0 (worst) to 100 (best).
    pub performance_score: u32,
    pub estimated_time_ms: f64,
    /// Executions of this shape the estimate is based on (0 = heuristic only).
    pub history_samples: u64,
    pub recommendations: Vec<String>,
    /// Columns worth indexing, as `table(column, ...)`.
    pub suggested_indexes: Vec<String>,
}

/// Score a query and suggest improvements.
///
/// `history` is the running average for the query's shape, when known;
/// it dominates the time estimate and penalizes the performance score
/// once it exceeds `slow_threshold_ms`.
pub fn analyze(
    query: &DatabaseQuery,
    history: Option<ShapeStats>,
    slow_threshold_ms: u64,
) -> QueryAnalysis {
    let mut complexity = 1u32;
    let mut recommendations = Vec::new();
    let mut suggested_indexes = Vec::new();

    match query {
        DatabaseQuery::Select(q) => {
            complexity += filter_complexity(&q.filter, &mut recommendations);
            complexity += 3 * q.include.len() as u32;
            complexity += q.order_by.len() as u32;

            if q.pagination.is_none() {
                complexity += 2;
                recommendations.push("add pagination to bound the result size".to_string());
            }
            if q.select.is_empty() {
                complexity += 1;
                recommendations.push("select only the fields the caller needs".to_string());
            }
            if q.include.len() > 2 {
                recommendations.push(format!(
                    "{} relation includes in one query; load rarely used relations separately",
                    q.include.len()
                ));
            }

            let mut columns = index_columns(&q.filter);
            if let Some(first) = q.order_by.iter().next() {
                if first.field != "id" && !columns.contains(&first.field.as_str()) {
                    columns.push(first.field.as_str());
                }
            }
            push_index(&mut suggested_indexes, &q.table, &columns);
        }
        DatabaseQuery::Insert(q) => {
            let rows = q.data.rows().len();
            complexity += (rows / 100) as u32;
            if rows > LARGE_BATCH {
                recommendations.push(format!(
                    "batch of {rows} rows; split it into chunks of at most {LARGE_BATCH}"
                ));
            }
        }
        DatabaseQuery::Update(q) => {
            complexity += 1 + filter_complexity(&q.filter, &mut recommendations);
            if !q.filter.contains_key("id") {
                recommendations
                    .push("update matches by non-key fields; prefer filtering by id".to_string());
            }
            push_index(&mut suggested_indexes, &q.table, &index_columns(&q.filter));
        }
        DatabaseQuery::Delete(q) => {
            complexity += 1 + filter_complexity(&q.filter, &mut recommendations);
            if !q.filter.contains_key("id") {
                recommendations
                    .push("delete matches by non-key fields; prefer filtering by id".to_string());
            }
            push_index(&mut suggested_indexes, &q.table, &index_columns(&q.filter));
        }
        DatabaseQuery::Raw(q) => {
            let sql = q.sql.to_ascii_uppercase();
            complexity += 5;
            for keyword in [" JOIN ", "GROUP BY", "ORDER BY", "DISTINCT", "HAVING", "UNION"] {
                complexity += 2 * sql.matches(keyword).count() as u32;
            }
            // Subqueries.
            complexity += 3 * sql.matches("(SELECT").count() as u32;
            if sql.contains("SELECT *") {
                recommendations.push("avoid SELECT * in raw SQL".to_string());
            }
            if sql.trim_start().starts_with("SELECT") && !sql.contains("LIMIT") {
                recommendations.push("add a LIMIT to raw reads".to_string());
            }
        }
    }

    let mut performance = 100i64 - 5 * i64::from(complexity);
    let estimated_time_ms = match history {
        Some(stats) => {
            if stats.average_time_ms > slow_threshold_ms as f64 {
                performance -= 30;
                recommendations.push(format!(
                    "queries of this shape average {:.1}ms, above the {slow_threshold_ms}ms slow-query threshold",
                    stats.average_time_ms
                ));
            } else {
                performance -= (stats.average_time_ms / 10.0).min(20.0) as i64;
            }
            stats.average_time_ms
        }
        None => f64::from(complexity) * MS_PER_COMPLEXITY_POINT,
    };

    QueryAnalysis {
        shape: QueryShape::of(query).to_string(),
        complexity_score: complexity,
        performance_score: performance.clamp(0, 100) as u32,
        estimated_time_ms,
        history_samples: history.map_or(0, |stats| stats.executions),
        recommendations,
        suggested_indexes,
    }
}

fn filter_complexity(filter: &WhereClause, recommendations: &mut Vec<String>) -> u32 {
    let mut score = 0u32;
    for (field, condition) in filter {
        score += condition.predicate_count() as u32;
        if let Condition::Ops(ops) = condition {
            if ops.contains.is_some() {
                score += 2;
                recommendations.push(format!(
                    "substring match on `{field}` scans every row; consider a search index"
                ));
            }
            if let Some(values) = &ops.one_of {
                score += (values.len() / 10) as u32;
                if values.len() > LARGE_IN_LIST {
                    recommendations.push(format!(
                        "`in` list on `{field}` has {} values; stage them in a table and join",
                        values.len()
                    ));
                }
            }
        }
    }
    score
}

/// Equality columns first, then range columns; `contains` and `id` never.
fn index_columns(filter: &WhereClause) -> Vec<&str> {
    let mut equality = Vec::new();
    let mut range = Vec::new();
    for (field, condition) in filter {
        if field == "id" {
            continue;
        }
        match condition {
            Condition::Eq(_) => equality.push(field.as_str()),
            Condition::Ops(ops) if ops.one_of.is_some() => equality.push(field.as_str()),
            Condition::Ops(ops) if ops.contains.is_none() => range.push(field.as_str()),
            Condition::Ops(_) => {}
        }
    }
    equality.extend(range);
    equality
}

fn push_index(out: &mut Vec<String>, table: &str, columns: &[&str]) {
    if !columns.is_empty() {
        out.push(format!("{table}({})", columns.join(", ")));
    }
}
