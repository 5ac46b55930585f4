//! Error types for bulkfetch
//!
//! This module provides the error handling for the library:
//! - The crate-wide [`Error`] and its [`Result`] alias
//! - [`DatabaseError`] for the resumable state store
//! - [`FetchError`] and [`SinkError`], the classified outcomes of the external
//!   downloader and storage collaborators
//! - [`FailureClass`], the taxonomy the orchestrator uses to decide between
//!   waiting, retrying, failing a task, and tripping the circuit breaker

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bulkfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bulkfetch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed CSV input
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// No proxy currently qualifies for acquisition
    ///
    /// This is a recoverable condition: callers back off and try again.
    #[error("no healthy proxy available")]
    NoHealthyProxy,

    /// The run-level circuit breaker tripped
    #[error("circuit breaker open after {consecutive_failures} consecutive task failures (threshold {threshold})")]
    CircuitOpen {
        /// Consecutive task failures observed when the breaker tripped
        consecutive_failures: u32,
        /// Configured error threshold
        threshold: u32,
    },

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Malformed item ID
    #[error("invalid item id: {0}")]
    InvalidItemId(String),

    /// Unparsable proxy endpoint
    #[error("invalid proxy endpoint: {0}")]
    InvalidProxy(String),

    /// External tool execution failed (downloader binary)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The single writer task is gone and can no longer accept updates
    #[error("state writer is closed")]
    WriterClosed,
}

/// Outcome classification of a failed fetch by the external downloader
///
/// Raw transport errors never reach the orchestrator; downloaders convert them
/// into one of these variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The attempt exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The proxy refused, reset, or stalled the transfer
    #[error("proxy transfer failed: {0}")]
    Proxy(String),

    /// Other transient network failure (DNS, connection reset, 5xx)
    #[error("network failure: {0}")]
    Network(String),

    /// The item does not exist upstream
    #[error("item not found: {0}")]
    NotFound(String),

    /// The item exists but is permanently unavailable (private, removed, geo/age-locked)
    #[error("item restricted: {0}")]
    Restricted(String),

    /// The item ID is malformed
    #[error("malformed item id: {0}")]
    MalformedId(String),

    /// The downloader itself failed in a way that will not improve on retry
    #[error("downloader failure: {0}")]
    Tool(String),
}

/// Failure of the external storage sink
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Temporary failure (upload timeout, throttling); the task may retry
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Unrecoverable failure (missing artifact, invalid destination)
    #[error("storage failure: {0}")]
    Permanent(String),
}

/// Failure taxonomy used by the orchestrator to pick a reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// No healthy proxy available; wait and retry acquisition
    TransientResource,
    /// Timeout or connection failure; retry with another proxy up to max-retries
    TransientTransfer,
    /// Item missing, restricted, or malformed; fail the task immediately
    PermanentItem,
    /// Failure rate exceeded the threshold; stop scheduling
    Systemic,
}

impl FailureClass {
    /// Whether another attempt of the same task may succeed
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureClass::TransientResource | FailureClass::TransientTransfer
        )
    }
}

impl FetchError {
    /// Classify this fetch failure
    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::Timeout(_) | FetchError::Proxy(_) | FetchError::Network(_) => {
                FailureClass::TransientTransfer
            }
            FetchError::NotFound(_)
            | FetchError::Restricted(_)
            | FetchError::MalformedId(_)
            | FetchError::Tool(_) => FailureClass::PermanentItem,
        }
    }

    /// Whether the failure is attributable to the proxy that carried the transfer
    pub fn blames_proxy(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::Proxy(_) | FetchError::Network(_)
        )
    }
}

impl SinkError {
    /// Classify this storage failure
    pub fn class(&self) -> FailureClass {
        match self {
            SinkError::Transient(_) => FailureClass::TransientTransfer,
            SinkError::Permanent(_) => FailureClass::PermanentItem,
        }
    }
}

impl Error {
    /// Classify a crate error for orchestration purposes
    pub fn class(&self) -> FailureClass {
        match self {
            Error::NoHealthyProxy => FailureClass::TransientResource,
            Error::CircuitOpen { .. } => FailureClass::Systemic,
            Error::InvalidItemId(_) => FailureClass::PermanentItem,
            Error::Network(_) | Error::Io(_) => FailureClass::TransientTransfer,
            _ => FailureClass::PermanentItem,
        }
    }
}
