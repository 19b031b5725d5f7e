//! Provider-agnostic query descriptions.
//!
//! A [`DatabaseQuery`] is a tagged union on `type`; each kind carries only the
//! fields that are meaningful for it. Queries are immutable values built by a
//! caller and consumed once by the router.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::options::QueryOptions;
use crate::value::{Record, Value};

/// Operator map for a single field.
///
/// Every operator that is set must hold (explicit conjunction), so
/// `{gte: 10, lte: 20}` is a closed range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionOps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<Value>,
}

impl ConditionOps {
    /// Require `field >= value`.
    pub fn gte(mut self, value: impl Into<Value>) -> Self {
        self.gte = Some(value.into());
        self
    }

    /// Require `field <= value`.
    pub fn lte(mut self, value: impl Into<Value>) -> Self {
        self.lte = Some(value.into());
        self
    }

    /// Require `field > value`.
    pub fn gt(mut self, value: impl Into<Value>) -> Self {
        self.gt = Some(value.into());
        self
    }

    /// Require `field < value`.
    pub fn lt(mut self, value: impl Into<Value>) -> Self {
        self.lt = Some(value.into());
        self
    }

    /// Require `field` to equal one of `values`.
    pub fn one_of<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.one_of = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Require `field` to contain `value` (substring or array membership).
    pub fn contains(mut self, value: impl Into<Value>) -> Self {
        self.contains = Some(value.into());
        self
    }

    /// Number of operators set.
    pub fn len(&self) -> usize {
        [
            self.gte.is_some(),
            self.lte.is_some(),
            self.gt.is_some(),
            self.lt.is_some(),
            self.one_of.is_some(),
            self.contains.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    /// True when no operator is set.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Condition on one field: plain equality or an operator map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Operator map (`{"gte": 10}`).
    Ops(ConditionOps),
    /// Scalar equality.
    Eq(Value),
}

impl Condition {
    /// Equality condition.
    pub fn eq(value: impl Into<Value>) -> Self {
        Condition::Eq(value.into())
    }

    /// Start an operator map.
    pub fn ops() -> ConditionOps {
        ConditionOps::default()
    }

    /// Number of individual predicates this condition contributes.
    pub fn predicate_count(&self) -> usize {
        match self {
            Condition::Eq(_) => 1,
            Condition::Ops(ops) => ops.len(),
        }
    }
}

impl From<ConditionOps> for Condition {
    fn from(ops: ConditionOps) -> Self {
        Condition::Ops(ops)
    }
}

/// Conjunction of per-field conditions.
pub type WhereClause = BTreeMap<String, Condition>;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub field: String,
    pub direction: OrderDirection,
}

impl OrderSpec {
    /// Ascending order on a field.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Descending order on a field.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Desc,
        }
    }
}

/// Ordered list of sort keys; the first key is the primary one.
///
/// Decodes from either `{"price": "desc", "name": "asc"}` (document order is
/// kept) or `[{"field": "price", "direction": "desc"}]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBy(pub Vec<OrderSpec>);

impl OrderBy {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OrderSpec> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Serialize for OrderBy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OrderBy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderByVisitor;

        impl<'de> Visitor<'de> for OrderByVisitor {
            type Value = OrderBy;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field to asc|desc or a list of order specs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<OrderBy, A::Error> {
                let mut specs = Vec::new();
                while let Some((field, direction)) = map.next_entry::<String, OrderDirection>()? {
                    specs.push(OrderSpec { field, direction });
                }
                Ok(OrderBy(specs))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<OrderBy, A::Error> {
                let mut specs = Vec::new();
                while let Some(spec) = seq.next_element::<OrderSpec>()? {
                    specs.push(spec);
                }
                Ok(OrderBy(specs))
            }
        }

        deserializer.deserialize_any(OrderByVisitor)
    }
}

/// Page-based pagination (pages start at 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    /// Number of rows to skip.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

/// Rows to insert: one record or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertData {
    Many(Vec<Record>),
    One(Record),
}

impl InsertData {
    /// Borrow the rows as a slice.
    pub fn rows(&self) -> &[Record] {
        match self {
            InsertData::Many(rows) => rows,
            InsertData::One(row) => std::slice::from_ref(row),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, InsertData::Many(_))
    }
}

/// Read rows from one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectQuery {
    pub table: String,
    #[serde(rename = "where", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter: WhereClause,
    #[serde(default, skip_serializing_if = "OrderBy::is_empty")]
    pub order_by: OrderBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "QueryOptions::is_default")]
    pub options: QueryOptions,
}

impl SelectQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: WhereClause::new(),
            order_by: OrderBy::default(),
            pagination: None,
            select: vec![],
            include: vec![],
            options: QueryOptions::default(),
        }
    }

    /// Add an equality condition.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), Condition::eq(value));
        self
    }

    /// Add an arbitrary condition.
    pub fn condition(mut self, field: impl Into<String>, condition: impl Into<Condition>) -> Self {
        self.filter.insert(field.into(), condition.into());
        self
    }

    /// Append an ordering key.
    pub fn order_by(mut self, spec: OrderSpec) -> Self {
        self.order_by.0.push(spec);
        self
    }

    /// Set pagination.
    pub fn page(mut self, page: u32, limit: u32) -> Self {
        self.pagination = Some(Pagination::new(page, limit));
        self
    }

    /// Project the given fields.
    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Load a relation.
    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.include.push(relation.into());
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Insert one row or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertQuery {
    pub table: String,
    pub data: InsertData,
    #[serde(default, skip_serializing_if = "QueryOptions::is_default")]
    pub options: QueryOptions,
}

impl InsertQuery {
    pub fn one(table: impl Into<String>, row: Record) -> Self {
        Self {
            table: table.into(),
            data: InsertData::One(row),
            options: QueryOptions::default(),
        }
    }

    pub fn many(table: impl Into<String>, rows: Vec<Record>) -> Self {
        Self {
            table: table.into(),
            data: InsertData::Many(rows),
            options: QueryOptions::default(),
        }
    }
}

/// Patch every row matching `where`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuery {
    pub table: String,
    #[serde(rename = "where", default)]
    pub filter: WhereClause,
    pub data: Record,
    #[serde(default, skip_serializing_if = "QueryOptions::is_default")]
    pub options: QueryOptions,
}

impl UpdateQuery {
    pub fn new(table: impl Into<String>, data: Record) -> Self {
        Self {
            table: table.into(),
            filter: WhereClause::new(),
            data,
            options: QueryOptions::default(),
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), Condition::eq(value));
        self
    }

    pub fn condition(mut self, field: impl Into<String>, condition: impl Into<Condition>) -> Self {
        self.filter.insert(field.into(), condition.into());
        self
    }
}

/// Remove every row matching `where`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    pub table: String,
    #[serde(rename = "where", default)]
    pub filter: WhereClause,
    #[serde(default, skip_serializing_if = "QueryOptions::is_default")]
    pub options: QueryOptions,
}

impl DeleteQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: WhereClause::new(),
            options: QueryOptions::default(),
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), Condition::eq(value));
        self
    }

    pub fn condition(mut self, field: impl Into<String>, condition: impl Into<Condition>) -> Self {
        self.filter.insert(field.into(), condition.into());
        self
    }
}

/// Raw SQL with positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQuery {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
    /// Table the statement touches, when known (drives cache invalidation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "QueryOptions::is_default")]
    pub options: QueryOptions,
}

impl RawQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: vec![],
            table: None,
            options: QueryOptions::default(),
        }
    }

    pub fn params<V: Into<Value>>(mut self, params: impl IntoIterator<Item = V>) -> Self {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// True when the statement only reads.
    ///
    /// Anything that cannot be shown to be a read counts as a write. A `WITH`
    /// statement is a read only when its main verb is `SELECT` or `VALUES`,
    /// and a `PRAGMA` only when it assigns nothing.
    pub fn is_read_only(&self) -> bool {
        let words = top_level_words(&self.sql);
        if let Some(end) = words.iter().position(|w| w == ";") {
            if end + 1 < words.len() {
                return false;
            }
        }

        match words.first().map(String::as_str) {
            Some("SELECT" | "VALUES") => true,
            Some("WITH") => matches!(
                words.iter().map(String::as_str).find(|w| {
                    matches!(*w, "SELECT" | "VALUES" | "INSERT" | "UPDATE" | "DELETE" | "REPLACE")
                }),
                Some("SELECT" | "VALUES")
            ),
            Some("PRAGMA") => !words.iter().any(|w| w == "="),
            _ => false,
        }
    }
}

/// Upper-cased words of `sql` outside literals, comments and parentheses.
/// Top-level `=` and `;` are kept as words of their own.
fn top_level_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut depth = 0usize;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' {
            if depth == 0 {
                word.push(c.to_ascii_uppercase());
            }
            continue;
        }
        if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }

        match c {
            '\'' | '"' | '`' => skip_past(&mut chars, c),
            '[' => skip_past(&mut chars, ']'),
            '-' if chars.peek() == Some(&'-') => skip_past(&mut chars, '\n'),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '=' | ';' if depth == 0 => words.push(c.to_string()),
            _ => {}
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    words
}

fn skip_past(chars: &mut impl Iterator<Item = char>, end: char) {
    for c in chars.by_ref() {
        if c == end {
            break;
        }
    }
}

/// Discriminant of a [`DatabaseQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    Raw,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Select => "select",
            QueryKind::Insert => "insert",
            QueryKind::Update => "update",
            QueryKind::Delete => "delete",
            QueryKind::Raw => "raw",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider-agnostic query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseQuery {
    Select(SelectQuery),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
    Raw(RawQuery),
}

impl DatabaseQuery {
    /// Start a select query.
    pub fn select(table: impl Into<String>) -> SelectQuery {
        SelectQuery::new(table)
    }

    /// Decode a query from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn kind(&self) -> QueryKind {
        match self {
            DatabaseQuery::Select(_) => QueryKind::Select,
            DatabaseQuery::Insert(_) => QueryKind::Insert,
            DatabaseQuery::Update(_) => QueryKind::Update,
            DatabaseQuery::Delete(_) => QueryKind::Delete,
            DatabaseQuery::Raw(_) => QueryKind::Raw,
        }
    }

    /// Target table (raw queries only report one when tagged).
    pub fn table(&self) -> Option<&str> {
        match self {
            DatabaseQuery::Select(q) => Some(&q.table),
            DatabaseQuery::Insert(q) => Some(&q.table),
            DatabaseQuery::Update(q) => Some(&q.table),
            DatabaseQuery::Delete(q) => Some(&q.table),
            DatabaseQuery::Raw(q) => q.table.as_deref(),
        }
    }

    pub fn options(&self) -> &QueryOptions {
        match self {
            DatabaseQuery::Select(q) => &q.options,
            DatabaseQuery::Insert(q) => &q.options,
            DatabaseQuery::Update(q) => &q.options,
            DatabaseQuery::Delete(q) => &q.options,
            DatabaseQuery::Raw(q) => &q.options,
        }
    }

    /// Mutable access to the options (used to strip them for cache keys).
    pub fn options_mut(&mut self) -> &mut QueryOptions {
        match self {
            DatabaseQuery::Select(q) => &mut q.options,
            DatabaseQuery::Insert(q) => &mut q.options,
            DatabaseQuery::Update(q) => &mut q.options,
            DatabaseQuery::Delete(q) => &mut q.options,
            DatabaseQuery::Raw(q) => &mut q.options,
        }
    }

    /// Conditions of the query, if the kind has any.
    pub fn filter(&self) -> Option<&WhereClause> {
        match self {
            DatabaseQuery::Select(q) => Some(&q.filter),
            DatabaseQuery::Update(q) => Some(&q.filter),
            DatabaseQuery::Delete(q) => Some(&q.filter),
            DatabaseQuery::Insert(_) | DatabaseQuery::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, DatabaseQuery::Raw(_))
    }

    /// Select with at least one relation include.
    pub fn has_includes(&self) -> bool {
        matches!(self, DatabaseQuery::Select(q) if !q.include.is_empty())
    }

    /// Insert whose payload is an array.
    pub fn is_bulk_insert(&self) -> bool {
        matches!(self, DatabaseQuery::Insert(q) if q.data.is_batch())
    }

    /// True when executing the query may change stored data.
    pub fn is_write(&self) -> bool {
        match self {
            DatabaseQuery::Select(_) => false,
            DatabaseQuery::Raw(q) => !q.is_read_only(),
            _ => true,
        }
    }

    /// Reject malformed queries before they reach an adapter.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(table) = self.table() {
            if table.trim().is_empty() {
                return Err(Error::invalid("table name must not be empty"));
            }
        }
        if let Some(filter) = self.filter() {
            for (field, condition) in filter {
                if let Condition::Ops(ops) = condition {
                    if ops.is_empty() {
                        return Err(Error::invalid(format!(
                            "condition on `{field}` has no operators"
                        )));
                    }
                }
            }
        }

        match self {
            DatabaseQuery::Select(q) => {
                if let Some(p) = q.pagination {
                    if p.page == 0 || p.limit == 0 {
                        return Err(Error::invalid("pagination page and limit start at 1"));
                    }
                }
            }
            DatabaseQuery::Insert(q) => {
                if q.data.rows().is_empty() {
                    return Err(Error::invalid("insert batch is empty"));
                }
            }
            DatabaseQuery::Update(q) => {
                if q.filter.is_empty() {
                    return Err(Error::invalid("update requires a where clause"));
                }
                if q.data.is_empty() {
                    return Err(Error::invalid("update data is empty"));
                }
                if q.data.contains_key("id") {
                    return Err(Error::invalid("update cannot change the id field"));
                }
            }
            DatabaseQuery::Delete(q) => {
                if q.filter.is_empty() {
                    return Err(Error::invalid("delete requires a where clause"));
                }
            }
            DatabaseQuery::Raw(q) => {
                if q.sql.trim().is_empty() {
                    return Err(Error::invalid("raw query requires sql"));
                }
            }
        }
        Ok(())
    }
}

impl From<SelectQuery> for DatabaseQuery {
    fn from(q: SelectQuery) -> Self {
        DatabaseQuery::Select(q)
    }
}

impl From<InsertQuery> for DatabaseQuery {
    fn from(q: InsertQuery) -> Self {
        DatabaseQuery::Insert(q)
    }
}

impl From<UpdateQuery> for DatabaseQuery {
    fn from(q: UpdateQuery) -> Self {
        DatabaseQuery::Update(q)
    }
}

impl From<DeleteQuery> for DatabaseQuery {
    fn from(q: DeleteQuery) -> Self {
        DatabaseQuery::Delete(q)
    }
}

impl From<RawQuery> for DatabaseQuery {
    fn from(q: RawQuery) -> Self {
        DatabaseQuery::Raw(q)
    }
}
