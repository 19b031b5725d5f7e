//! Core error types.

use multiorm_proto::ProviderId;
use thiserror::Error;

/// Failures raised by a backend adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter has no live connection.
    #[error("adapter is not connected")]
    NotConnected,

    /// The query is valid in general but not for this adapter's data.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The adapter does not implement the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A uniqueness or integrity rule was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Lock contention or deadlock; safe to retry.
    #[error("database busy: {0}")]
    Busy(String),

    /// The call exceeded its deadline.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Sled storage error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Row encoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl AdapterError {
    /// Whether the failure may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::NotConnected | AdapterError::Busy(_) | AdapterError::Timeout(_)
        )
    }
}

impl From<tokio::task::JoinError> for AdapterError {
    fn from(err: tokio::task::JoinError) -> Self {
        AdapterError::Worker(err.to_string())
    }
}

/// Errors surfaced by the query router to its callers.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Malformed input (caller bug, not retryable).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// No connected adapter could be selected.
    #[error("no connected provider available (tried {tried:?})")]
    ProviderUnavailable { tried: Vec<ProviderId> },

    /// The selected adapter failed.
    #[error("{provider} adapter failed: {source}")]
    AdapterExecution {
        provider: ProviderId,
        retryable: bool,
        #[source]
        source: AdapterError,
    },

    /// A transaction was submitted with zero queries.
    #[error("transaction contains no queries")]
    EmptyTransaction,
}

impl RouterError {
    /// Wrap an adapter failure with provider context.
    pub fn adapter(provider: ProviderId, source: AdapterError) -> Self {
        RouterError::AdapterExecution {
            provider,
            retryable: source.is_retryable(),
            source,
        }
    }

    /// Whether the caller may retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::ProviderUnavailable { .. } => true,
            RouterError::AdapterExecution { retryable, .. } => *retryable,
            RouterError::InvalidQuery(_) | RouterError::EmptyTransaction => false,
        }
    }

    /// HTTP status class an API layer should map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            RouterError::InvalidQuery(_) | RouterError::EmptyTransaction => 400,
            RouterError::ProviderUnavailable { .. } => 503,
            RouterError::AdapterExecution { retryable: true, .. } => 503,
            RouterError::AdapterExecution { source, .. } => match source {
                AdapterError::Constraint(_) => 409,
                AdapterError::InvalidQuery(_) | AdapterError::Unsupported(_) => 422,
                _ => 500,
            },
        }
    }

    /// Provider involved in the failure, if any.
    pub fn provider(&self) -> Option<ProviderId> {
        match self {
            RouterError::AdapterExecution { provider, .. } => Some(*provider),
            _ => None,
        }
    }
}

impl From<multiorm_proto::Error> for RouterError {
    fn from(err: multiorm_proto::Error) -> Self {
        match err {
            multiorm_proto::Error::InvalidQuery(msg) => RouterError::InvalidQuery(msg),
            other => RouterError::InvalidQuery(other.to_string()),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
