//! Error types for recollect

use thiserror::Error;

/// Result type alias for recollect operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in recollect
#[derive(Error, Debug)]
pub enum Error {
    /// The extraction collaborator failed or produced content outside the configured schemas
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unresolved namespace template, invalid schema set, missing runtime
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The job was superseded or the scheduler shut down
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A job's extractor or store panicked
    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl Error {
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn panicked(msg: impl Into<String>) -> Self {
        Self::Panicked(msg.into())
    }

    /// Whether this error is the no-op cancellation outcome rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Whether this error came from the store apply/snapshot phase
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Sqlite(_) | Self::Io(_))
    }
}
