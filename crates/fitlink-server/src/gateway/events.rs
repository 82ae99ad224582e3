//! Realtime wire contract.
//!
//! Every frame is a JSON object tagged by `type` (snake_case) with
//! camelCase fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fitlink_shared::{MessageType, Role};
use fitlink_store::{empty_metadata, Message};

use crate::error::ServerError;

/// The body of a send, shared by the realtime and HTTP paths.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Defaults to the other participant.
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub reply_to_message_id: Option<Uuid>,
    /// Opaque value echoed back in `message_sent`.
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    JoinConversation {
        conversation_id: Uuid,
    },
    LeaveConversation {
        conversation_id: Uuid,
    },
    SendMessage {
        conversation_id: Uuid,
        #[serde(flatten)]
        message: OutgoingMessage,
    },
    TypingStart {
        conversation_id: Uuid,
    },
    TypingStop {
        conversation_id: Uuid,
    },
    MarkRead {
        conversation_id: Uuid,
    },
    GetOnlineUsers {
        conversation_id: Uuid,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        user_id: String,
        role: Role,
        connection_id: Uuid,
    },
    JoinedConversation {
        conversation_id: Uuid,
        /// Messages that moved to `delivered` because of this join.
        delivered: Vec<Message>,
    },
    LeftConversation {
        conversation_id: Uuid,
    },
    MessageSent {
        client_ref: Option<String>,
        message: Message,
    },
    NewMessage {
        message: Message,
    },
    MessagesDelivered {
        conversation_id: Uuid,
        receiver_id: String,
        message_ids: Vec<Uuid>,
    },
    MessagesRead {
        conversation_id: Uuid,
        reader_id: String,
        read_at: DateTime<Utc>,
        count: u64,
    },
    UserTyping {
        conversation_id: Uuid,
        user_id: String,
        is_typing: bool,
    },
    UserStatus {
        user_id: String,
        is_online: bool,
        last_seen_at: DateTime<Utc>,
    },
    OnlineUsers {
        conversation_id: Uuid,
        user_ids: Vec<String>,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn error(err: &ServerError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.public_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_inbound_frames() {
        let conv = Uuid::new_v4();

        let join: ClientEvent = serde_json::from_value(json!({
            "type": "join_conversation",
            "conversationId": conv,
        }))
        .unwrap();
        assert_eq!(join, ClientEvent::JoinConversation { conversation_id: conv });

        let send: ClientEvent = serde_json::from_value(json!({
            "type": "send_message",
            "conversationId": conv,
            "receiverId": "t1",
            "content": "Hi",
            "clientRef": "tmp-1",
        }))
        .unwrap();
        match send {
            ClientEvent::SendMessage {
                conversation_id,
                message,
            } => {
                assert_eq!(conversation_id, conv);
                assert_eq!(message.receiver_id.as_deref(), Some("t1"));
                assert_eq!(message.message_type, MessageType::Text);
                assert_eq!(message.client_ref.as_deref(), Some("tmp-1"));
                assert!(message.metadata.is_object());
            }
            other => panic!("unexpected {other:?}"),
        }

        let ping: ClientEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientEvent::Ping);

        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn outbound_shape() {
        let conv = Uuid::new_v4();
        let value = serde_json::to_value(ServerEvent::UserTyping {
            conversation_id: conv,
            user_id: "c1".into(),
            is_typing: true,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "user_typing",
                "conversationId": conv,
                "userId": "c1",
                "isTyping": true,
            })
        );

        let err = serde_json::to_value(ServerEvent::error(&ServerError::RateLimited)).unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "rate_limited");
    }
}
