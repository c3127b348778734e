//! Crate-wide error taxonomy.
//!
//! Mirrors the error categories every component recovers from locally:
//! configuration failures are fatal at startup, connection/persistence/
//! external failures are retried, and data failures are counted and
//! dropped rather than propagated.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickstreamError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("connection error on source '{source_name}': {message}")]
    Connection {
        source_name: String,
        message: String,
    },

    #[error("data error for symbol '{symbol}': {message}")]
    Data { symbol: String, message: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("resource limit reached: {0}")]
    Resource(String),

    #[error("external dependency '{dependency}' unavailable: {message}")]
    External {
        dependency: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("already running")]
    AlreadyRunning,
    #[error("not running")]
    NotRunning,
    #[error("already starting")]
    AlreadyStarting,
    #[error("already stopping")]
    AlreadyStopping,
    #[error("shutdown grace period elapsed")]
    ShutdownTimeout,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("queue is full")]
    QueueFull,
    #[error("item failed validation: {0}")]
    InvalidItem(String),
    #[error("batch failed integrity check: {0}")]
    IntegrityFailure(String),
    #[error("writer transient error: {0}")]
    WriterTransient(String),
    #[error("writer fatal error: {0}")]
    WriterFatal(String),
}

impl TickstreamError {
    /// Mirrors the §7 propagation policy: whether a caller may usefully
    /// retry this error, as opposed to surfacing it immediately.
    pub fn retryable(&self) -> bool {
        match self {
            TickstreamError::Connection { .. } => true,
            TickstreamError::External { .. } => true,
            TickstreamError::Persistence(PersistenceError::WriterTransient(_)) => true,
            TickstreamError::Persistence(PersistenceError::QueueFull) => true,
            TickstreamError::Resource(_) => true,
            TickstreamError::Configuration(_) => false,
            TickstreamError::Data { .. } => false,
            TickstreamError::Persistence(_) => false,
            TickstreamError::Lifecycle(_) => false,
        }
    }
}

/// Matches `RetryManager::shouldRetry`'s substring classification of
/// externally-sourced error strings (writer/cache errors arrive as
/// opaque messages, not typed errors).
pub fn message_is_retryable(message: &str) -> bool {
    const RETRYABLE_SUBSTRINGS: &[&str] = &[
        "timeout",
        "connection",
        "network",
        "temporary",
        "busy",
        "unavailable",
    ];
    let lower = message.to_lowercase();
    RETRYABLE_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable() {
        let err = TickstreamError::Connection {
            source_name: "binance".into(),
            message: "reset".into(),
        };
        assert!(err.retryable());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        let err = TickstreamError::Configuration("missing symbols".into());
        assert!(!err.retryable());
    }

    #[test]
    fn message_classification_is_case_insensitive() {
        assert!(message_is_retryable("Connection RESET by peer"));
        assert!(message_is_retryable("upstream TEMPORARILY unavailable"));
        assert!(!message_is_retryable("invalid signature"));
    }
}
