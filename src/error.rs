//! Error types for workq.
//!
//! Work-function failures are not crate errors; they travel as
//! [`ClassifiedError`](crate::model::failure::ClassifiedError) so that
//! classification happens exactly once per failure.

use thiserror::Error;

use crate::model::JobState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("handler already registered for job kind {0}")]
    DuplicateHandler(String),

    #[error("no handler registered for job kind {0}")]
    UnknownJobKind(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
