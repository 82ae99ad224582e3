use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// UUID parsing error.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Metadata (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(Uuid),

    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),

    /// The caller is not a participant of the conversation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The conversation is blocked and rejects new messages.
    #[error("Conversation {0} is blocked")]
    ConversationBlocked(Uuid),

    #[error("Validation failed: {0}")]
    Validation(String),

    /// A concurrent write won and its result could not be re-read.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<fitlink_shared::SharedError> for StoreError {
    fn from(e: fitlink_shared::SharedError) -> Self {
        StoreError::Validation(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
