//! Input parsing and command execution against a [`QueryRouter`].

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use multiorm_core::QueryRouter;
use multiorm_proto::{DatabaseQuery, InsertQuery, Record, TransactionOptions};

use crate::formatter::Formatter;

/// Parse a query document.
///
/// Accepts a JSON array of queries, or one JSON query per line. Blank
/// lines and lines starting with `#` or `//` are skipped.
pub fn parse_queries(text: &str) -> Result<Vec<DatabaseQuery>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("invalid query array");
    }

    text.lines()
        .map(str::trim)
        .enumerate()
        .filter(|(_, l)| !l.is_empty() && !l.starts_with("//") && !l.starts_with('#'))
        .map(|(n, l)| {
            DatabaseQuery::from_json(l).with_context(|| format!("line {}: invalid query", n + 1))
        })
        .collect()
}

/// Parse a seed document: an object mapping table names to row arrays.
pub fn parse_seed(text: &str) -> Result<BTreeMap<String, Vec<Record>>> {
    serde_json::from_str(text).context("seed file must map table names to arrays of rows")
}

/// Insert seed rows into every connected adapter so reads see the same
/// data whichever provider they are routed to.
pub async fn seed(router: &QueryRouter, tables: &BTreeMap<String, Vec<Record>>) -> Result<usize> {
    let mut inserted = 0;
    for adapter in router.adapters().iter() {
        if !adapter.is_connected() {
            continue;
        }
        for (table, rows) in tables {
            if rows.is_empty() {
                continue;
            }
            let query: DatabaseQuery = InsertQuery::many(table.as_str(), rows.clone()).into();
            let result = adapter
                .execute(&query)
                .await
                .with_context(|| format!("seeding `{}` on {}", table, adapter.provider()))?;
            inserted += result.len();
        }
        tracing::info!(provider = %adapter.provider(), "seeded {} table(s)", tables.len());
    }
    Ok(inserted)
}

/// Run each query in order and render its result.
///
/// A failing query is reported and execution continues with the next one.
/// Returns the rendered output and the number of failures.
pub async fn run_queries(
    router: &QueryRouter,
    queries: &[DatabaseQuery],
    formatter: &dyn Formatter,
) -> (Vec<String>, usize) {
    let mut outputs = Vec::with_capacity(queries.len());
    let mut failures = 0;
    for query in queries {
        match router.query(query).await {
            Ok(result) => outputs.push(formatter.format_query_result(&result)),
            Err(e) => {
                failures += 1;
                outputs.push(formatter.format_error(&e.to_string()));
            }
        }
    }
    (outputs, failures)
}

/// Run all queries as one transaction.
pub async fn run_transaction(
    router: &QueryRouter,
    queries: &[DatabaseQuery],
    options: &TransactionOptions,
    formatter: &dyn Formatter,
) -> Result<String> {
    if queries.is_empty() {
        bail!("transaction needs at least one query");
    }
    let result = router.transaction(queries, options).await?;
    Ok(formatter.format_transaction_result(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::TableFormatter;
    use multiorm_core::{
        AdapterSet, MemoryAdapter, MemoryCacheStore, RouterConfig, SledAdapter, SledConfig,
    };
    use multiorm_proto::{ProviderId, QueryKind};
    use std::sync::Arc;

    fn router() -> QueryRouter {
        let adapters = AdapterSet::new()
            .with(Arc::new(MemoryAdapter::new()))
            .with(Arc::new(SledAdapter::new(SledConfig::temporary())));
        QueryRouter::new(
            RouterConfig::new(ProviderId::Memory),
            Arc::new(MemoryCacheStore::new(100, 60)),
            adapters,
        )
    }

    #[test]
    fn test_parse_lines_skips_comments() {
        let text = r#"
# products
{"type": "select", "table": "products"}
// count
{"type": "delete", "table": "products", "where": {"id": 3}}
"#;
        let queries = parse_queries(text).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].kind(), QueryKind::Select);
        assert_eq!(queries[1].kind(), QueryKind::Delete);
    }

    #[test]
    fn test_parse_array() {
        let text = r#"[
            {"type": "insert", "table": "t", "data": {"a": 1}},
            {"type": "raw", "sql": "SELECT 1"}
        ]"#;
        let queries = parse_queries(text).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1].kind(), QueryKind::Raw);
    }

    #[test]
    fn test_parse_reports_line() {
        let err = parse_queries("{\"type\": \"select\", \"table\": \"t\"}\nnot json")
            .unwrap_err()
            .to_string();
        assert!(err.contains("line 2"), "{err}");
    }

    #[test]
    fn test_parse_seed_rejects_non_object() {
        assert!(parse_seed("[1, 2]").is_err());
        let seed = parse_seed(r#"{"t": [{"a": 1}, {"a": 2}]}"#).unwrap();
        assert_eq!(seed["t"].len(), 2);
    }

    #[tokio::test]
    async fn test_seed_reaches_every_connected_adapter() {
        let router = router();
        assert!(router.connect_all().await.is_empty());

        let tables = parse_seed(r#"{"items": [{"name": "a"}, {"name": "b"}]}"#).unwrap();
        let inserted = seed(&router, &tables).await.unwrap();
        assert_eq!(inserted, 4);

        for provider in [ProviderId::Memory, ProviderId::Sled] {
            let adapter = router.adapters().get(provider).unwrap();
            let rows = adapter
                .execute(&DatabaseQuery::select("items").into())
                .await
                .unwrap();
            assert_eq!(rows.len(), 2, "{provider}");
        }
        router.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_run_queries_continues_after_failure() {
        let router = router();
        router.connect_all().await;

        let queries = parse_queries(
            r#"[
                {"type": "insert", "table": "t", "data": {"id": 1}},
                {"type": "insert", "table": "t", "data": {"id": 1}},
                {"type": "select", "table": "t"}
            ]"#,
        )
        .unwrap();
        let (outputs, failures) = run_queries(&router, &queries, &TableFormatter).await;
        assert_eq!(outputs.len(), 3);
        assert_eq!(failures, 1);
        assert!(outputs[1].starts_with("Error:"));
        assert!(outputs[2].contains("1 row(s)"));
        router.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_empty_transaction_rejected() {
        let router = router();
        let err = run_transaction(&router, &[], &TransactionOptions::default(), &TableFormatter)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }
}
