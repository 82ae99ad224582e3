use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SharedError;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Which side of the marketplace a user is on. Fixed per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Trainer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Trainer => "trainer",
        }
    }

    pub fn counterpart(&self) -> Role {
        match self {
            Role::Client => Role::Trainer,
            Role::Trainer => Role::Client,
        }
    }
}

impl FromStr for Role {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Role::Client),
            "trainer" => Ok(Role::Trainer),
            other => Err(SharedError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Message type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageType {
    pub const ALL: [MessageType; 4] = [
        MessageType::Text,
        MessageType::Image,
        MessageType::File,
        MessageType::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::System => "system",
        }
    }

    /// Image and file messages must carry an [`AttachmentDescriptor`].
    pub fn requires_attachment(&self) -> bool {
        matches!(self, MessageType::Image | MessageType::File)
    }
}

impl FromStr for MessageType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "file" => Ok(MessageType::File),
            "system" => Ok(MessageType::System),
            other => Err(SharedError::UnknownMessageType(other.to_string())),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Message status
// ---------------------------------------------------------------------------

/// Delivery state of a message: `sent -> delivered -> read`, or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
        MessageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
            MessageStatus::Failed => 3,
        }
    }

    /// Status only moves forward; `failed` is terminal and only reachable
    /// from `sent`.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Sent, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(SharedError::UnknownMessageStatus(other.to_string())),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Conversation status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Blocked,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Blocked => "blocked",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            "blocked" => Ok(ConversationStatus::Blocked),
            other => Err(SharedError::UnknownConversationStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// An already-uploaded file, as returned by attachment storage. Stored under
/// `metadata.attachment` of image and file messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDescriptor {
    pub url: String,
    pub file_name: String,
    pub size: u64,
    pub mime_type: String,
}

impl AttachmentDescriptor {
    /// Extract and validate the descriptor from a message's metadata.
    pub fn from_metadata(metadata: &serde_json::Value) -> Result<Self, SharedError> {
        let raw = metadata
            .get("attachment")
            .ok_or_else(|| SharedError::InvalidAttachment("missing 'attachment'".into()))?;

        let descriptor: AttachmentDescriptor = serde_json::from_value(raw.clone())
            .map_err(|e| SharedError::InvalidAttachment(e.to_string()))?;

        if descriptor.url.trim().is_empty() {
            return Err(SharedError::InvalidAttachment("empty url".into()));
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Read));
        assert!(MessageStatus::Delivered.can_advance_to(MessageStatus::Read));

        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Sent));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Read));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Failed));
        assert!(!MessageStatus::Failed.can_advance_to(MessageStatus::Read));
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Failed));
    }

    #[test]
    fn role_round_trips_through_str() {
        assert_eq!("trainer".parse::<Role>().unwrap(), Role::Trainer);
        assert_eq!(Role::Client.counterpart(), Role::Trainer);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn attachment_from_metadata() {
        let meta = serde_json::json!({
            "attachment": {
                "url": "https://cdn.example/a.png",
                "fileName": "a.png",
                "size": 2048,
                "mimeType": "image/png"
            }
        });
        let att = AttachmentDescriptor::from_metadata(&meta).unwrap();
        assert_eq!(att.file_name, "a.png");
        assert_eq!(att.size, 2048);

        assert!(AttachmentDescriptor::from_metadata(&serde_json::json!({})).is_err());
        assert!(AttachmentDescriptor::from_metadata(&serde_json::json!({
            "attachment": { "url": "", "fileName": "x", "size": 1, "mimeType": "a/b" }
        }))
        .is_err());
    }

    #[test]
    fn wire_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&MessageType::Image).unwrap(),
            "\"image\""
        );
        assert_eq!(
            serde_json::to_string(&ConversationStatus::Blocked).unwrap(),
            "\"blocked\""
        );
    }
}
