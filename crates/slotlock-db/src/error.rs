//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A row changed underneath an optimistic write.
    #[error("stale object: {0}")]
    StaleObject(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for slotlock_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => slotlock_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => slotlock_core::Error::Conflict(msg),
            DbError::StaleObject(msg) => slotlock_core::Error::Conflict(msg),
            DbError::LockTimeout(msg) => slotlock_core::Error::Timeout(msg),
            _ => slotlock_core::Error::Internal(err.to_string()),
        }
    }
}
