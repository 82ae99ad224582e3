//! Message rows and the conversation rollups that move with them.
//!
//! Every write here runs inside one `IMMEDIATE` transaction that touches both
//! the message rows and the owning conversation, so an insert and its unread
//! increment can never be observed apart.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use fitlink_shared::constants::{MAX_CONTENT_CHARS, PREVIEW_CHARS};
use fitlink_shared::{AttachmentDescriptor, ConversationStatus, MessageStatus, MessageType, Role};

use crate::conversations::{ensure_participant, load_conversation};
use crate::database::{format_ts, page_offset, parse_enum, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, NewMessage, ReadReceipt};

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, sender_id, receiver_id, message_type,
    content, metadata, status, created_at, read_at, reply_to_message_id";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Persist a message with status `sent`, bump the receiver's unread
    /// counter and refresh the conversation preview.
    pub fn insert_message(&mut self, new: &NewMessage) -> Result<Message> {
        validate_new_message(new)?;

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let conversation = load_conversation(&tx, new.conversation_id)?;
        let sender_role = ensure_participant(&conversation, &new.sender_id)?;

        if conversation.status == ConversationStatus::Blocked {
            return Err(StoreError::ConversationBlocked(conversation.id));
        }

        let expected_receiver = conversation.other_participant(&new.sender_id).unwrap_or_default();
        if new.receiver_id != expected_receiver {
            return Err(StoreError::Validation(format!(
                "receiver {} is not the other participant of conversation {}",
                new.receiver_id, conversation.id
            )));
        }

        if let Some(reply_id) = new.reply_to_message_id {
            let parent: Option<String> = tx
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1",
                    params![reply_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            match parent {
                None => return Err(StoreError::MessageNotFound(reply_id)),
                Some(conv) if conv != conversation.id.to_string() => {
                    return Err(StoreError::Validation(
                        "reply target belongs to another conversation".into(),
                    ))
                }
                Some(_) => {}
            }
        }

        // Never go backwards in time within a conversation, even if the
        // wall clock does.
        let now = match conversation.last_message_at {
            Some(last) if last > Utc::now() => last,
            _ => Utc::now(),
        };

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            seq: conversation.total_message_count + 1,
            sender_id: new.sender_id.clone(),
            receiver_id: new.receiver_id.clone(),
            message_type: new.message_type,
            content: new.content.clone(),
            metadata: new.metadata.clone(),
            status: MessageStatus::Sent,
            created_at: now,
            read_at: None,
            reply_to_message_id: new.reply_to_message_id,
        };

        tx.execute(
            "INSERT INTO messages (id, conversation_id, seq, sender_id, receiver_id, message_type,
                                   content, metadata, status, created_at, reply_to_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.seq as i64,
                message.sender_id,
                message.receiver_id,
                message.message_type.as_str(),
                message.content,
                serde_json::to_string(&message.metadata)?,
                message.status.as_str(),
                format_ts(&message.created_at),
                message.reply_to_message_id.map(|id| id.to_string()),
            ],
        )?;

        let unread_column = unread_column(sender_role.counterpart());
        tx.execute(
            &format!(
                "UPDATE conversations SET
                     last_message_preview = ?1,
                     last_message_at      = ?2,
                     total_message_count  = total_message_count + 1,
                     {unread_column}      = {unread_column} + 1,
                     status = CASE WHEN status = 'archived' THEN 'active' ELSE status END
                 WHERE id = ?3"
            ),
            params![
                preview_for(message.message_type, &message.content),
                format_ts(&message.created_at),
                message.conversation_id.to_string(),
            ],
        )?;

        tx.commit()?;
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        self.conn()
            .query_row(&sql, params![id.to_string()], row_to_message)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::MessageNotFound(id),
                other => StoreError::Sqlite(other),
            })
    }

    /// One page of a conversation, oldest first. Pages count backwards from
    /// the newest message: page 1 is the most recent `limit` messages.
    pub fn list_messages(
        &self,
        conversation_id: Uuid,
        requester_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.get_conversation_for(conversation_id, requester_id)?;

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY seq DESC
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![conversation_id.to_string(), limit, page_offset(page, limit)],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Exact, case-sensitive substring search over messages in conversations
    /// `user_id` takes part in, newest first. Wildcard characters in `query`
    /// have no special meaning.
    pub fn search_messages(
        &self,
        user_id: &str,
        query: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StoreError::Validation("search query must not be empty".into()));
        }
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id IN (
                 SELECT id FROM conversations WHERE client_id = ?1 OR trainer_id = ?1
             )
               AND instr(content, ?2) > 0
             ORDER BY created_at DESC, seq DESC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![user_id, query, limit, page_offset(page, limit)],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Move `receiver_id`'s `sent` messages in the conversation to
    /// `delivered`. Returns the messages that changed, in order.
    pub fn mark_delivered(&mut self, conversation_id: Uuid, receiver_id: &str) -> Result<Vec<Message>> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let conversation = load_conversation(&tx, conversation_id)?;
        ensure_participant(&conversation, receiver_id)?;

        let mut delivered = update_returning(
            &tx,
            &format!(
                "UPDATE messages SET status = 'delivered'
                 WHERE conversation_id = ?1 AND receiver_id = ?2 AND status IN ({})
                 RETURNING {MESSAGE_COLUMNS}",
                statuses_advancing_to(MessageStatus::Delivered)
            ),
            params![conversation_id.to_string(), receiver_id],
        )?;

        tx.commit()?;
        delivered.sort_by_key(|m| m.seq);
        Ok(delivered)
    }

    /// Mark everything addressed to `reader_id` as read and reset only the
    /// reader's unread counter. Calling it again with nothing new is a no-op.
    pub fn mark_read(&mut self, conversation_id: Uuid, reader_id: &str) -> Result<ReadReceipt> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let conversation = load_conversation(&tx, conversation_id)?;
        let reader_role = ensure_participant(&conversation, reader_id)?;
        let read_at = Utc::now();

        let count = tx.execute(
            &format!(
                "UPDATE messages SET status = 'read', read_at = ?3
                 WHERE conversation_id = ?1 AND receiver_id = ?2
                   AND status IN ({})",
                statuses_advancing_to(MessageStatus::Read)
            ),
            params![conversation_id.to_string(), reader_id, format_ts(&read_at)],
        )?;

        let unread_column = unread_column(reader_role);
        tx.execute(
            &format!("UPDATE conversations SET {unread_column} = 0 WHERE id = ?1"),
            params![conversation_id.to_string()],
        )?;

        tx.commit()?;

        Ok(ReadReceipt {
            conversation_id,
            reader_id: reader_id.to_string(),
            read_at,
            count: count as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// SQL list of the stored statuses that may move to `next`.
fn statuses_advancing_to(next: MessageStatus) -> String {
    MessageStatus::ALL
        .iter()
        .filter(|status| status.can_advance_to(next))
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn validate_new_message(new: &NewMessage) -> Result<()> {
    if new.sender_id.trim().is_empty() || new.receiver_id.trim().is_empty() {
        return Err(StoreError::Validation("sender and receiver are required".into()));
    }
    if new.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(StoreError::Validation(format!(
            "content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    if !new.metadata.is_object() {
        return Err(StoreError::Validation("metadata must be a JSON object".into()));
    }
    if new.message_type == MessageType::Text && new.content.trim().is_empty() {
        return Err(StoreError::Validation("message content must not be empty".into()));
    }
    if new.message_type.requires_attachment() {
        AttachmentDescriptor::from_metadata(&new.metadata)?;
    }
    Ok(())
}

fn unread_column(role: Role) -> &'static str {
    match role {
        Role::Client => "client_unread_count",
        Role::Trainer => "trainer_unread_count",
    }
}

/// Text shown in conversation lists.
fn preview_for(message_type: MessageType, content: &str) -> String {
    let full = match message_type {
        MessageType::Text | MessageType::System => content.trim().to_string(),
        other if content.trim().is_empty() => format!("[{other}]"),
        other => format!("[{other}] {}", content.trim()),
    };
    if full.chars().count() <= PREVIEW_CHARS {
        full
    } else {
        let mut truncated: String = full.chars().take(PREVIEW_CHARS - 1).collect();
        truncated.push('…');
        truncated
    }
}

fn update_returning(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let seq: i64 = row.get(2)?;
    let type_str: String = row.get(5)?;
    let metadata_str: String = row.get(7)?;
    let status_str: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    let read_str: Option<String> = row.get(10)?;
    let reply_str: Option<String> = row.get(11)?;

    let metadata: serde_json::Value = serde_json::from_str(&metadata_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let read_at: Option<DateTime<Utc>> = read_str.map(|s| parse_ts(10, &s)).transpose()?;

    Ok(Message {
        id: parse_uuid(0, &id_str)?,
        conversation_id: parse_uuid(1, &conversation_str)?,
        seq: seq as u64,
        sender_id: row.get(3)?,
        receiver_id: row.get(4)?,
        message_type: parse_enum(5, &type_str)?,
        content: row.get(6)?,
        metadata,
        status: parse_enum(8, &status_str)?,
        created_at: parse_ts(9, &created_str)?,
        read_at,
        reply_to_message_id: reply_str.map(|s| parse_uuid(11, &s)).transpose()?,
    })
}
