//! MultiORM protocol types.
//!
//! This crate defines the provider-agnostic data model shared by the query
//! router, its backend adapters, and callers.
//!
//! # Modules
//!
//! - [`value`] - Runtime values and rows
//! - [`query`] - Query descriptions (a tagged union per query kind)
//! - [`options`] - Advisory query and transaction hints
//! - [`result`] - Normalized query and transaction results
//! - [`provider`] - Backend identifiers
//! - [`error`] - Validation errors
//!
//! # Example
//!
//! ```ignore
//! use multiorm_proto::{DatabaseQuery, Condition, OrderSpec};
//!
//! let query: DatabaseQuery = DatabaseQuery::select("products")
//!     .filter("category", "Electronics")
//!     .condition("price", Condition::ops().gte(10).lte(20))
//!     .order_by(OrderSpec::desc("price"))
//!     .page(2, 10)
//!     .into();
//! query.validate()?;
//! ```

pub mod error;
pub mod options;
pub mod provider;
pub mod query;
pub mod result;
pub mod value;

pub use error::Error;

// Re-export commonly used types at crate root
pub use options::{IsolationLevel, QueryOptions, TransactionOptions};
pub use provider::ProviderId;
pub use query::{
    Condition, ConditionOps, DatabaseQuery, DeleteQuery, InsertData, InsertQuery, OrderBy,
    OrderDirection, OrderSpec, Pagination, QueryKind, RawQuery, SelectQuery, UpdateQuery,
    WhereClause,
};
pub use result::{
    PaginationInfo, QueryResult, ResultMetadata, TransactionMetadata, TransactionResult,
};
pub use value::{record, Record, Value};
