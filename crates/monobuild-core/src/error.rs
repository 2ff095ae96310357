//! Error kinds shared across the coordinator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The request was malformed or failed admission validation.
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// An exclusive job already has a task in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("auth: {0}")]
    Auth(String),

    /// Safe to retry with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// A collaborator (scheduler, GitHub, storage) reported a failure.
    #[error("upstream {code}: {message}")]
    Upstream { code: String, message: String },

    /// Unrecoverable. Aborts init, or drives an orderly shutdown in
    /// steady state.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn upstream(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Upstream {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
