//! Error types for SlotLock.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the job queue should try the failed operation again.
    ///
    /// Ownership and input errors are precondition failures; re-running
    /// the same job cannot fix them.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Forbidden(_) | Error::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
