//! Error types for backwork.
//!
//! Only submission-time and storage failures reach callers. Execution faults
//! and exhausted retries are outcomes, recorded on the work record and
//! surfaced through status observation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed submission. Nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("work record not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::State,
        to: crate::model::State,
    },

    /// The durable store rejected a read or write. Scheduling pauses until
    /// a health check succeeds.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error came from the durable store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
