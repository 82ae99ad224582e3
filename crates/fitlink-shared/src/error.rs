use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError {
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Unknown message status: {0}")]
    UnknownMessageStatus(String),

    #[error("Unknown conversation status: {0}")]
    UnknownConversationStatus(String),

    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),
}
