//! Output formatters for router results.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use multiorm_core::router::Selection;
use multiorm_core::{PerformanceMetrics, QueryAnalysis};
use multiorm_proto::{QueryResult, Record, TransactionResult, Value};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format a single query result.
    fn format_query_result(&self, result: &QueryResult) -> String;

    /// Format a committed transaction.
    fn format_transaction_result(&self, result: &TransactionResult) -> String;

    /// Format a routing decision.
    fn format_selection(&self, selection: &Selection) -> String;

    fn format_analysis(&self, analysis: &QueryAnalysis) -> String;

    fn format_metrics(&self, metrics: &PerformanceMetrics) -> String;

    /// Format an error message.
    fn format_error(&self, error: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_query_result(&self, result: &QueryResult) -> String {
        let mut output = if result.data.is_empty() {
            "No rows".to_string()
        } else {
            format!("{}\n{} row(s)", rows_as_table(&result.data), result.len())
        };

        let mut footer = vec![format!("provider: {}", result.provider)];
        if let Some(page) = &result.pagination {
            footer.push(format!(
                "page {}/{} ({} total)",
                page.page, page.total_pages, page.total
            ));
        } else if let Some(total) = result.total {
            if total != result.len() as u64 {
                footer.push(format!("{} affected", total));
            }
        }
        if result.metadata.cached {
            footer.push("cached".to_string());
        } else {
            footer.push(format!("{} ms", result.execution_time_ms));
        }

        output.push('\n');
        output.push_str(&footer.join(", "));
        output
    }

    fn format_transaction_result(&self, result: &TransactionResult) -> String {
        let mut table = Table::new();
        table.set_header(vec!["#", "rows", "total"]);
        for (i, inner) in result.results.iter().enumerate() {
            table.add_row(vec![
                Cell::new(i + 1),
                Cell::new(inner.len()),
                Cell::new(inner.total.map(|t| t.to_string()).unwrap_or_default()),
            ]);
        }

        format!(
            "{}\ncommitted on {} in {} ms ({} retries)",
            table, result.provider, result.execution_time_ms, result.metadata.retries
        )
    }

    fn format_selection(&self, selection: &Selection) -> String {
        selection.to_string()
    }

    fn format_analysis(&self, analysis: &QueryAnalysis) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["shape".to_string(), analysis.shape.clone()]);
        table.add_row(vec![
            "complexity".to_string(),
            analysis.complexity_score.to_string(),
        ]);
        table.add_row(vec![
            "performance".to_string(),
            analysis.performance_score.to_string(),
        ]);
        table.add_row(vec![
            "estimated time".to_string(),
            format!("{:.1} ms", analysis.estimated_time_ms),
        ]);
        table.add_row(vec![
            "history samples".to_string(),
            analysis.history_samples.to_string(),
        ]);
        for index in &analysis.suggested_indexes {
            table.add_row(vec!["suggested index".to_string(), index.clone()]);
        }

        let mut output = table.to_string();
        for recommendation in &analysis.recommendations {
            output.push_str("\n- ");
            output.push_str(recommendation);
        }
        output
    }

    fn format_metrics(&self, metrics: &PerformanceMetrics) -> String {
        let mut summary = Table::new();
        summary.set_header(vec!["Metric", "Value"]);
        summary.add_row(vec!["queries".to_string(), metrics.total_queries.to_string()]);
        summary.add_row(vec![
            "avg time".to_string(),
            format!("{:.2} ms", metrics.average_execution_time_ms),
        ]);
        summary.add_row(vec!["p50".to_string(), format!("{} ms", metrics.p50_ms)]);
        summary.add_row(vec!["p99".to_string(), format!("{} ms", metrics.p99_ms)]);
        summary.add_row(vec!["slow".to_string(), metrics.slow_queries.to_string()]);
        summary.add_row(vec![
            "error rate".to_string(),
            format!("{:.1}%", metrics.error_rate * 100.0),
        ]);
        summary.add_row(vec![
            "cache hits/misses".to_string(),
            format!("{}/{}", metrics.cache_hits, metrics.cache_misses),
        ]);

        if metrics.provider_usage.is_empty() {
            return summary.to_string();
        }

        let mut providers = Table::new();
        providers.set_header(vec!["Provider", "Queries", "Avg ms", "Errors"]);
        for (provider, usage) in &metrics.provider_usage {
            providers.add_row(vec![
                provider.to_string(),
                usage.queries.to_string(),
                format!("{:.2}", usage.average_time_ms),
                usage.errors.to_string(),
            ]);
        }
        format!("{}\n{}", summary, providers)
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}", error)
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl JsonFormatter {
    fn pretty<T: serde::Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Formatter for JsonFormatter {
    fn format_query_result(&self, result: &QueryResult) -> String {
        Self::pretty(result)
    }

    fn format_transaction_result(&self, result: &TransactionResult) -> String {
        Self::pretty(result)
    }

    fn format_selection(&self, selection: &Selection) -> String {
        serde_json::json!({
            "provider": selection.provider,
            "reason": selection.to_string(),
        })
        .to_string()
    }

    fn format_analysis(&self, analysis: &QueryAnalysis) -> String {
        Self::pretty(analysis)
    }

    fn format_metrics(&self, metrics: &PerformanceMetrics) -> String {
        Self::pretty(metrics)
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({
            "error": error
        })
        .to_string()
    }
}

/// Render rows as a table. Columns are the union of all row keys, `id` first.
fn rows_as_table(rows: &[Record]) -> Table {
    let columns = columns(rows);
    let mut table = Table::new();
    table.set_header(columns.iter().map(Cell::new).collect::<Vec<_>>());

    for row in rows {
        let cells: Vec<Cell> = columns
            .iter()
            .map(|col| Cell::new(row.get(col).map(format_value).unwrap_or_default()))
            .collect();
        table.add_row(cells);
    }
    table
}

fn columns(rows: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    let has_id = rows.iter().any(|row| row.contains_key("id"));
    if has_id {
        columns.push("id".to_string());
    }
    for row in rows {
        for key in row.keys() {
            if key != "id" && !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// Format a Value as a display string.
fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(format_value).collect();
            format!("[{}]", items.join(", "))
        }
        // Loaded relations; JSON keeps nesting readable.
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}
