//! Error types for the durable store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by [`crate::OfflineStore`].
#[derive(Debug, Error)]
pub enum PersistError {
    /// The database could not be opened.
    #[error("failed to open store at {}: {source}", path.display())]
    Open {
        /// Database path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: sled::Error,
    },

    /// A read or write against the database failed.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A record could not be serialized.
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    /// A stored record could not be deserialized.
    #[error("failed to decode record: {0}")]
    Decode(#[source] serde_json::Error),

    /// A stored record has an unexpected layout.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The store configuration is invalid.
    #[error("invalid store configuration: {0}")]
    Config(String),
}

/// Result type for store operations.
pub type PersistResult<T> = Result<T, PersistError>;
