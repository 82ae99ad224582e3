//! Domain model structs persisted in SQLite.
//!
//! Every struct derives `Serialize` with camelCase field names; these are the
//! shapes handed to HTTP callers and realtime clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fitlink_shared::{ConversationStatus, MessageStatus, MessageType, Role};

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// The public part of a user's profile, joined onto conversation listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// The 1:1 channel between a client and a trainer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub client_id: String,
    pub trainer_id: String,
    pub status: ConversationStatus,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub total_message_count: u64,
    pub client_unread_count: u64,
    pub trainer_unread_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// The role `user_id` plays in this conversation, if any.
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.client_id == user_id {
            Some(Role::Client)
        } else if self.trainer_id == user_id {
            Some(Role::Trainer)
        } else {
            None
        }
    }

    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        match self.role_of(user_id)? {
            Role::Client => Some(&self.trainer_id),
            Role::Trainer => Some(&self.client_id),
        }
    }

    pub fn participant_ids(&self) -> [&str; 2] {
        [&self.client_id, &self.trainer_id]
    }

    pub fn unread_for(&self, role: Role) -> u64 {
        match role {
            Role::Client => self.client_unread_count,
            Role::Trainer => self.trainer_unread_count,
        }
    }
}

/// A conversation as listed for one of its participants.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub other_participant: ProfileSummary,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MessageTypeCounts {
    pub text: u64,
    pub image: u64,
    pub file: u64,
    pub system: u64,
}

impl MessageTypeCounts {
    pub fn add(&mut self, message_type: MessageType, count: u64) {
        match message_type {
            MessageType::Text => self.text += count,
            MessageType::Image => self.image += count,
            MessageType::File => self.file += count,
            MessageType::System => self.system += count,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    pub conversation_id: Uuid,
    pub total_messages: u64,
    pub by_type: MessageTypeCounts,
    pub last_message_at: Option<DateTime<Utc>>,
    pub client_unread_count: u64,
    pub trainer_unread_count: u64,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Position in the conversation, assigned at write time. Authoritative
    /// for ordering.
    pub seq: u64,
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: MessageType,
    /// Text payload; a caption or file name for non-text types.
    pub content: String,
    pub metadata: serde_json::Value,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub reply_to_message_id: Option<Uuid>,
}

/// Input to [`crate::MessageStore::send_message`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub reply_to_message_id: Option<Uuid>,
}

pub fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Outcome of a mark-read call.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: Uuid,
    pub reader_id: String,
    pub read_at: DateTime<Utc>,
    /// Number of messages that moved to `read`. Zero means nothing changed.
    pub count: u64,
}
