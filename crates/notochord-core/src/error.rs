//! Error types for the notochord feature store.
//!
//! Every fallible operation in the crate returns [`Result`]. Lookups that
//! require existence fail with [`NotochordError::NotFound`]; malformed
//! prediction input fails with [`NotochordError::ShapeMismatch`] before the
//! store is touched.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the feature store.
#[derive(Debug, Error)]
pub enum NotochordError {
    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Transaction aborted: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Insert-if-absent is not available for SQL dialect '{dialect}'")]
    ConcurrencyConflict { dialect: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Lookup and shape errors
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for feature store operations.
pub type Result<T> = std::result::Result<T, NotochordError>;

impl From<std::io::Error> for NotochordError {
    fn from(err: std::io::Error) -> Self {
        NotochordError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for NotochordError {
    fn from(err: serde_json::Error) -> Self {
        NotochordError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for NotochordError {
    fn from(err: rusqlite::Error) -> Self {
        NotochordError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl NotochordError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        NotochordError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a not-found error for the given kind of object.
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        NotochordError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Wrap a failure that happened inside a staged swap.
    pub fn transaction(err: rusqlite::Error) -> Self {
        NotochordError::Transaction {
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Error for a poisoned or unavailable connection lock.
    pub(crate) fn lock_failed() -> Self {
        NotochordError::Database {
            message: "Failed to acquire connection lock".to_string(),
            source: None,
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only contention on the backing store qualifies. Nothing in this crate
    /// retries on its own.
    pub fn is_retryable(&self) -> bool {
        let source = match self {
            NotochordError::Database { source, .. } | NotochordError::Transaction { source, .. } => {
                source.as_ref()
            }
            _ => None,
        };

        matches!(
            source.and_then(|e| e.sqlite_error_code()),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}
