//! Catalog error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for monobuild_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => monobuild_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => monobuild_core::Error::Conflict(msg),
            DbError::InvalidData(msg) => monobuild_core::Error::Validation(msg),
            DbError::Database(e) => monobuild_core::Error::Transient(e.to_string()),
            DbError::Migration(e) => monobuild_core::Error::Fatal(e.to_string()),
        }
    }
}
