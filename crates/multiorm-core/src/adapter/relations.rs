//! Relation loading by naming convention.
//!
//! For a row of table `orders` and an include `customer`:
//! - to-one: the row carries `customer_id`, resolved against table `customer`
//!   or `customers`
//! - to-many: otherwise table `customer` (or `customers`) is scanned for rows
//!   whose `order_id` equals the row's `id`

use std::collections::BTreeMap;

use multiorm_proto::{Record, Value};

use super::rows::row_id;
use crate::error::AdapterError;

/// Naive English singular: `categories` -> `category`, `orders` -> `order`.
pub fn singular(name: &str) -> String {
    if let Some(stem) = name.strip_suffix("ies") {
        format!("{stem}y")
    } else if let Some(stem) = name.strip_suffix('s') {
        stem.to_string()
    } else {
        name.to_string()
    }
}

fn table_for<'a, T>(tables: &'a BTreeMap<String, T>, relation: &str) -> Option<&'a T> {
    tables
        .get(relation)
        .or_else(|| tables.get(&format!("{relation}s")))
}

/// Attach every include to every row.
///
/// `rows_of` exposes the stored rows of a table container.
pub fn load_includes<T>(
    tables: &BTreeMap<String, T>,
    rows_of: impl Fn(&T) -> &[Record],
    table: &str,
    rows: &mut [Record],
    include: &[String],
) -> Result<(), AdapterError> {
    let back_reference = format!("{}_id", singular(table));

    for relation in include {
        let foreign_key = format!("{relation}_id");
        let target = table_for(tables, relation).map(&rows_of);
        let to_one = rows.iter().any(|row| row.contains_key(&foreign_key));

        if !to_one && target.is_none() {
            return Err(AdapterError::InvalidQuery(format!(
                "unknown relation `{relation}` on `{table}`"
            )));
        }
        let target = target.unwrap_or(&[]);

        for row in rows.iter_mut() {
            let loaded = if to_one {
                let key = row.get(&foreign_key).cloned().unwrap_or(Value::Null);
                target
                    .iter()
                    .find(|candidate| {
                        candidate
                            .get("id")
                            .is_some_and(|id| !key.is_null() && id.loose_eq(&key))
                    })
                    .map_or(Value::Null, |found| Value::Object(found.clone()))
            } else {
                let id = row_id(row).map(Value::Int).unwrap_or(Value::Null);
                Value::Array(
                    target
                        .iter()
                        .filter(|child| {
                            !id.is_null()
                                && child
                                    .get(&back_reference)
                                    .is_some_and(|fk| fk.loose_eq(&id))
                        })
                        .cloned()
                        .map(Value::Object)
                        .collect(),
                )
            };
            row.insert(relation.clone(), loaded);
        }
    }
    Ok(())
}
