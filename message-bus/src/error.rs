//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Dispatcher failed to deliver a notification
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Outbox entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entry is in a state that does not allow the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
