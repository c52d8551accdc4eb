//! Crate-level error types.
//!
//! [`DriftnetError`] unifies every failure the collector can observe
//! (configuration, transport, subscription, decoding, book sequencing,
//! storage, timeouts) behind a single enum so callers can match on the
//! variant they care about while still using the `?` operator.

use std::future::Future;
use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DriftnetError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriftnetError {
    /// An invalid symbol or parameter was supplied. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport failed (refused, reset, TLS, HTTP).
    #[error("connection error: {0}")]
    Connection(String),

    /// The venue rejected the subscription or answered ambiguously.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// A single message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// An order-book update did not follow the last applied update id.
    #[error("sequence gap on {symbol}: expected {expected}, received {received}")]
    SequenceGap {
        symbol: String,
        expected: u64,
        received: u64,
    },

    /// Book data that would violate the book invariants (crossed, unsorted).
    #[error("invalid book: {0}")]
    InvalidBook(String),

    /// A storage backend operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// An operation did not complete within its configured deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl DriftnetError {
    /// Returns `true` for failures that compromise the connection itself and
    /// must be handled by the collector's retry loop.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Subscription(_) | Self::Timeout { .. }
        )
    }
}

impl From<tungstenite::Error> for DriftnetError {
    fn from(e: tungstenite::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for DriftnetError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<reqwest::Error> for DriftnetError {
    fn from(e: reqwest::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<sqlx::Error> for DriftnetError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Runs `fut` under a deadline, mapping expiry to [`DriftnetError::Timeout`].
pub async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriftnetError::Timeout { operation, after }),
    }
}
