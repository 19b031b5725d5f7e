//! Structural fingerprints of queries.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use multiorm_proto::{Condition, ConditionOps, DatabaseQuery, WhereClause};

/// Fingerprint of a query's structure.
///
/// Two queries share a shape when they differ only in literal values: the
/// kind, table, filtered fields with their operators, projected fields,
/// includes, ordering and pagination presence are hashed; values are not.
/// Field lists are sorted first, so listing order does not matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryShape {
    hash: u64,
}

impl QueryShape {
    pub fn of(query: &DatabaseQuery) -> Self {
        let mut hasher = DefaultHasher::new();
        query.kind().hash(&mut hasher);
        query.table().hash(&mut hasher);

        match query {
            DatabaseQuery::Select(q) => {
                hash_filter(&q.filter, &mut hasher);
                hash_sorted(&q.select, &mut hasher);
                hash_sorted(&q.include, &mut hasher);
                for spec in q.order_by.iter() {
                    spec.field.hash(&mut hasher);
                    spec.direction.hash(&mut hasher);
                }
                q.pagination.is_some().hash(&mut hasher);
            }
            DatabaseQuery::Insert(q) => {
                q.data.is_batch().hash(&mut hasher);
                let mut columns: Vec<&String> =
                    q.data.rows().iter().flat_map(|row| row.keys()).collect();
                columns.sort();
                columns.dedup();
                columns.hash(&mut hasher);
            }
            DatabaseQuery::Update(q) => {
                hash_filter(&q.filter, &mut hasher);
                q.data.keys().collect::<Vec<_>>().hash(&mut hasher);
            }
            DatabaseQuery::Delete(q) => hash_filter(&q.filter, &mut hasher),
            DatabaseQuery::Raw(q) => {
                // Whitespace-normalized statement text; params are values.
                q.sql.split_whitespace().for_each(|token| token.hash(&mut hasher));
                q.params.len().hash(&mut hasher);
            }
        }

        Self {
            hash: hasher.finish(),
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.hash
    }
}

impl fmt::Display for QueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.hash)
    }
}

/// Operator names present in a condition, in a fixed order.
pub fn operator_names(condition: &Condition) -> Vec<&'static str> {
    match condition {
        Condition::Eq(_) => vec!["eq"],
        Condition::Ops(ops) => ops_names(ops),
    }
}

fn ops_names(ops: &ConditionOps) -> Vec<&'static str> {
    let mut names = Vec::with_capacity(ops.len());
    if ops.gte.is_some() {
        names.push("gte");
    }
    if ops.lte.is_some() {
        names.push("lte");
    }
    if ops.gt.is_some() {
        names.push("gt");
    }
    if ops.lt.is_some() {
        names.push("lt");
    }
    if ops.one_of.is_some() {
        names.push("in");
    }
    if ops.contains.is_some() {
        names.push("contains");
    }
    names
}

fn hash_filter<H: Hasher>(filter: &WhereClause, hasher: &mut H) {
    filter.len().hash(hasher);
    // WhereClause is a BTreeMap, so fields already iterate sorted.
    for (field, condition) in filter {
        field.hash(hasher);
        operator_names(condition).hash(hasher);
        // `in` list cardinality is structural.
        if let Condition::Ops(ConditionOps {
            one_of: Some(values),
            ..
        }) = condition
        {
            values.len().hash(hasher);
        }
    }
}

fn hash_sorted<H: Hasher>(items: &[String], hasher: &mut H) {
    let mut sorted: Vec<&String> = items.iter().collect();
    sorted.sort();
    sorted.hash(hasher);
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiorm_proto::{record, DeleteQuery, InsertQuery, OrderSpec, RawQuery};

    #[test]
    fn test_same_structure_different_values() {
        let a: DatabaseQuery = DatabaseQuery::select("products")
            .filter("category", "Electronics")
            .condition("price", Condition::ops().gte(10).lte(20))
            .page(1, 10)
            .into();
        let b: DatabaseQuery = DatabaseQuery::select("products")
            .filter("category", "Books")
            .condition("price", Condition::ops().gte(1).lte(5))
            .page(3, 50)
            .into();

        assert_eq!(QueryShape::of(&a), QueryShape::of(&b));
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let a: DatabaseQuery = DatabaseQuery::select("products")
            .fields(["name", "price"])
            .include("reviews")
            .include("brand")
            .into();
        let b: DatabaseQuery = DatabaseQuery::select("products")
            .fields(["price", "name"])
            .include("brand")
            .include("reviews")
            .into();

        assert_eq!(QueryShape::of(&a), QueryShape::of(&b));
    }

    #[test]
    fn test_structure_changes_shape() {
        let base: DatabaseQuery = DatabaseQuery::select("products").filter("id", 1).into();
        let other_table: DatabaseQuery = DatabaseQuery::select("orders").filter("id", 1).into();
        let other_op: DatabaseQuery = DatabaseQuery::select("products")
            .condition("id", Condition::ops().gt(1))
            .into();
        let ordered: DatabaseQuery = DatabaseQuery::select("products")
            .filter("id", 1)
            .order_by(OrderSpec::desc("id"))
            .into();
        let delete: DatabaseQuery = DeleteQuery::new("products").filter("id", 1).into();

        let shape = QueryShape::of(&base);
        assert_ne!(shape, QueryShape::of(&other_table));
        assert_ne!(shape, QueryShape::of(&other_op));
        assert_ne!(shape, QueryShape::of(&ordered));
        assert_ne!(shape, QueryShape::of(&delete));
    }

    #[test]
    fn test_insert_and_raw_shapes() {
        let one: DatabaseQuery = InsertQuery::one("t", record([("a", 1)])).into();
        let many: DatabaseQuery = InsertQuery::many("t", vec![record([("a", 2)])]).into();
        assert_ne!(QueryShape::of(&one), QueryShape::of(&many));

        let a: DatabaseQuery = RawQuery::new("SELECT *  FROM t WHERE id = ?").params([1]).into();
        let b: DatabaseQuery = RawQuery::new("SELECT * FROM t WHERE id = ?").params([9]).into();
        assert_eq!(QueryShape::of(&a), QueryShape::of(&b));
    }

    #[test]
    fn test_operator_names() {
        assert_eq!(operator_names(&Condition::eq(1)), vec!["eq"]);
        let range: Condition = Condition::ops().gte(1).lte(2).into();
        assert_eq!(operator_names(&range), vec!["gte", "lte"]);
    }
}
