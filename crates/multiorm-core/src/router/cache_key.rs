//! Canonical query-cache keys.
//!
//! Keys look like `{prefix}:{table}:{hash}` where `hash` is the blake3 hex
//! digest of the query's canonical JSON. Options are stripped and the
//! `select`/`include` lists are sorted first, so queries that differ only in
//! hints or listing order share an entry. Provider ids never appear in keys.

use multiorm_proto::DatabaseQuery;

/// Table segment for raw queries that do not name a table.
pub const UNTABLED_SEGMENT: &str = "_raw";

/// Cache key for a query.
pub fn cache_key(prefix: &str, query: &DatabaseQuery) -> Result<String, serde_json::Error> {
    let mut canonical = query.clone();
    *canonical.options_mut() = Default::default();
    if let DatabaseQuery::Select(select) = &mut canonical {
        select.select.sort();
        select.select.dedup();
        select.include.sort();
        select.include.dedup();
    }

    // `serde_json::Value` objects are sorted maps, so re-encoding through it
    // fixes key order.
    let value = serde_json::to_value(&canonical)?;
    let bytes = serde_json::to_vec(&value)?;
    let digest = blake3::hash(&bytes);

    Ok(format!(
        "{prefix}:{}:{}",
        table_segment(query.table()),
        digest.to_hex()
    ))
}

/// Glob matching every cached entry of a table.
pub fn table_pattern(prefix: &str, table: Option<&str>) -> String {
    format!("{prefix}:{}:*", table_segment(table))
}

/// Glob matching every entry under the prefix.
pub fn prefix_pattern(prefix: &str) -> String {
    format!("{prefix}:*")
}

fn table_segment(table: Option<&str>) -> &str {
    table.unwrap_or(UNTABLED_SEGMENT)
}
