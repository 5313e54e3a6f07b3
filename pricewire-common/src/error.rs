//! Common error types for PriceWire

use thiserror::Error;

/// Common result type for PriceWire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across PriceWire services
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Semantic failure classes surfaced by stream and job handlers.
///
/// The consumer framework picks a disposition from the class:
/// - `Transient`, `RateLimited`, `Config`: retry in place, dead-letter once
///   the retry budget is exhausted
/// - `Malformed`: advance the cursor with a warning, never dead-letter
/// - `Shutdown`: abandon the entry without advancing the cursor
/// - `Fatal`: abort the worker loop so the process can exit non-zero
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("shutdown requested")]
    Shutdown,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkerError {
    /// Whether this failure should be retried in place and eventually
    /// dead-lettered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::Transient(_) | WorkerError::RateLimited(_) | WorkerError::Config(_)
        )
    }
}

impl From<Error> for WorkerError {
    fn from(err: Error) -> Self {
        match err {
            Error::Serde(e) => WorkerError::Malformed(e.to_string()),
            Error::Config(msg) => WorkerError::Config(msg),
            Error::QueueFull(msg) => WorkerError::Transient(format!("queue full: {msg}")),
            other => WorkerError::Transient(other.to_string()),
        }
    }
}
