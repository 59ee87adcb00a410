//! Error types for livepg
//!
//! Errors fall into two classes. Validation errors come back synchronously
//! from `select()` and configuration loading and are never retried.
//! Everything else is operational: it is delivered through the engine's
//! error signal or a subscription's event stream and never aborts the
//! update loop.

use thiserror::Error;

/// Errors that can occur while running live queries
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LiveError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("trigger maintenance failed for table {table}: {message}")]
    Trigger { table: String, message: String },

    #[error("malformed notice: {0}")]
    MalformedNotice(String),

    #[error("invalid notification {payload}: {reason}")]
    InvalidNotification { payload: String, reason: String },

    #[error("edit script does not fit the row set: {0}")]
    Diff(String),

    #[error("engine has been shut down")]
    Closed,
}

impl LiveError {
    /// Returns true for caller-programming errors raised synchronously
    pub fn is_validation(&self) -> bool {
        matches!(self, LiveError::InvalidArgument(_) | LiveError::Config(_))
    }

    /// Returns true for errors that are reported asynchronously
    pub fn is_operational(&self) -> bool {
        !self.is_validation()
    }
}

impl From<tokio_postgres::Error> for LiveError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            LiveError::Connection(err.to_string())
        } else {
            LiveError::Query(err.to_string())
        }
    }
}

impl From<deadpool_postgres::PoolError> for LiveError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        LiveError::Connection(format!("pool get failed: {err}"))
    }
}

/// Result type for live query operations
pub type Result<T> = std::result::Result<T, LiveError>;
