//! Error types for deskline-core

use thiserror::Error;

/// Result type alias using deskline-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in deskline-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Row not found in the local replica
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation payload rejected by schema validation
    #[error(transparent)]
    Validation(#[from] crate::protocol::ValidationError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Sync transport failure (non-success response, broken stream)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server refused a sync request for carrying too many operations
    #[error("Batch too large: {0}")]
    BatchTooLarge(String),
}

impl Error {
    /// Whether the error came from the network path rather than local state.
    ///
    /// Transport failures leave the outbox untouched and are retried later.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Transport(_) | Self::BatchTooLarge(_))
    }
}
