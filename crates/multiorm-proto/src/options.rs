//! Advisory execution hints for queries and transactions.

use serde::{Deserialize, Serialize};

/// Per-query hints consumed by the router, never by adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    /// Serve from and write through to the query cache.
    pub use_cache: bool,
    /// Cache TTL in seconds (router default when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
    /// Caller allows the request to be batched with others.
    pub use_batching: bool,
    /// Caller-assigned priority (higher is more important).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Deadline for the adapter call in milliseconds.
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl QueryOptions {
    /// Options with caching enabled.
    pub fn cached() -> Self {
        Self {
            use_cache: true,
            ..Default::default()
        }
    }

    /// Set the cache TTL in seconds (also enables caching).
    pub fn with_cache_ttl(mut self, ttl_secs: u64) -> Self {
        self.use_cache = true;
        self.cache_ttl = Some(ttl_secs);
        self
    }

    /// Set the adapter deadline.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the priority hint.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// True when every field holds its default.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Transaction isolation levels passed through to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for a multi-statement transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionOptions {
    /// Requested isolation level (adapter default when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
    /// Deadline for the whole transaction in milliseconds.
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Let the adapter retry its own transaction on lock contention.
    pub retry_on_deadlock: bool,
    /// Upper bound on adapter-side retries.
    pub max_retries: u32,
}

impl TransactionOptions {
    /// Enable adapter-side deadlock retries.
    pub fn with_deadlock_retries(mut self, max_retries: u32) -> Self {
        self.retry_on_deadlock = true;
        self.max_retries = max_retries;
        self
    }

    /// Set the isolation level.
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Set the transaction deadline.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Number of attempts the adapter may make.
    pub fn attempts(&self) -> u32 {
        if self.retry_on_deadlock {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }
}
