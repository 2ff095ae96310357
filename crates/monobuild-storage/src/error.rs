//! Storage error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("invalid object: {0}")]
    Decode(String),
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound(err.to_string()),
            other => {
                // S3 auth failures come back as generic errors; classify by
                // the embedded status code.
                let msg = other.to_string();
                if msg.contains("403") || msg.contains("401") || msg.contains("AccessDenied") {
                    StorageError::Auth(msg)
                } else {
                    StorageError::Transient(msg)
                }
            }
        }
    }
}

impl From<StorageError> for monobuild_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => monobuild_core::Error::NotFound(msg),
            StorageError::Auth(msg) => monobuild_core::Error::Auth(msg),
            StorageError::Transient(msg) => monobuild_core::Error::Transient(msg),
            StorageError::Decode(msg) => monobuild_core::Error::upstream("storage", msg),
        }
    }
}
