use thiserror::Error;
use uuid::Uuid;

use crate::registry::Provider;

/// Errors raised by the local conversation store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Thread not found: {0}")]
    ThreadNotFound(Uuid),

    #[error("Thread already exists: {0}")]
    DuplicateThread(Uuid),

    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by a chat session to its caller.
///
/// Validation failures (blank input, a send while a reply is in flight) are not
/// errors; the session ignores them and returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("No API key configured for provider '{0}'")]
    MissingApiKey(Provider),

    #[error("A reply or retry is already in flight")]
    Busy,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Settings error: {0}")]
    Settings(#[from] anyhow::Error),
}

/// Errors from a title/summary request.
#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("Summary request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Summary endpoint returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid summary response: {0}")]
    InvalidResponse(String),

    #[error("Title completion failed: {0:#}")]
    Completion(anyhow::Error),
}
