//! Query validation errors.

use thiserror::Error;

/// Errors raised while validating or decoding a query description.
#[derive(Debug, Error)]
pub enum Error {
    /// The query is malformed (caller bug, never retryable).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A provider name could not be parsed.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// JSON decoding failed.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an `InvalidQuery` error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidQuery(message.into())
    }
}
