//! Normalized results returned by every adapter.

use serde::{Deserialize, Serialize};

use crate::options::IsolationLevel;
use crate::provider::ProviderId;
use crate::query::Pagination;
use crate::value::Record;

/// Pagination summary attached to paged selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationInfo {
    /// Summarise a page request against the unpaged row count.
    pub fn new(pagination: Pagination, total: u64) -> Self {
        let limit = pagination.limit.max(1) as u64;
        let total_pages = total.div_ceil(limit);
        Self {
            page: pagination.page,
            limit: pagination.limit,
            total,
            total_pages,
            has_next: (pagination.page as u64) < total_pages,
            has_prev: pagination.page > 1,
        }
    }
}

/// Flags describing how a result was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub cached: bool,
    pub batched: bool,
    pub optimized: bool,
}

/// Result of a single query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Returned rows (post-mutation rows for update, pre-deletion rows for delete).
    pub data: Vec<Record>,
    /// Total matching rows before pagination, or affected rows for writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationInfo>,
    pub execution_time_ms: u64,
    /// Provider that actually served the query.
    pub provider: ProviderId,
    #[serde(default)]
    pub metadata: ResultMetadata,
}

impl QueryResult {
    /// Result with rows and no pagination.
    pub fn new(provider: ProviderId, data: Vec<Record>) -> Self {
        let total = data.len() as u64;
        Self {
            data,
            total: Some(total),
            pagination: None,
            execution_time_ms: 0,
            provider,
            metadata: ResultMetadata::default(),
        }
    }

    /// Empty result for a provider.
    pub fn empty(provider: ProviderId) -> Self {
        Self::new(provider, vec![])
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationInfo) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Number of rows in `data`.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Transaction bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMetadata {
    /// Adapter-side retries performed before the committed attempt.
    pub retries: u32,
    /// True when at least one attempt was rolled back.
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
}

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    /// One result per sub-query, in order.
    pub results: Vec<QueryResult>,
    pub execution_time_ms: u64,
    pub provider: ProviderId,
    #[serde(default)]
    pub metadata: TransactionMetadata,
}

impl TransactionResult {
    pub fn new(provider: ProviderId, results: Vec<QueryResult>) -> Self {
        Self {
            results,
            execution_time_ms: 0,
            provider,
            metadata: TransactionMetadata::default(),
        }
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    pub fn with_metadata(mut self, metadata: TransactionMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
