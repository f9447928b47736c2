//! Error handling - one hierarchy for every collaborator boundary

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket/IO errors
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed or incomplete command
    #[error("Validation error: {0}")]
    Validation(String),

    /// Command kind has no handler
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Quote source failed or answered garbage
    #[error("Quote error: {0}")]
    Quote(String),

    /// Collaborator transport failure, safe to resend
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Retries exhausted the caller's deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A conditional ledger update did not match
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Document does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Audit sink errors
    #[error("Audit error: {0}")]
    Audit(String),
}

impl Error {
    /// Transport-level failures are the only ones worth resending.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Network(_))
    }
}
