//! Conversation rows: get-or-create, listing, status and stats.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use fitlink_shared::{ConversationStatus, MessageType, Role};

use crate::database::{
    format_ts, is_constraint_violation, page_offset, parse_enum, parse_ts, parse_uuid, Database,
};
use crate::error::{Result, StoreError};
use crate::models::{
    Conversation, ConversationStats, ConversationSummary, MessageTypeCounts, ProfileSummary,
};

const CONVERSATION_COLUMNS: &str = "c.id, c.client_id, c.trainer_id, c.status,
    c.last_message_preview, c.last_message_at, c.total_message_count,
    c.client_unread_count, c.trainer_unread_count, c.created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the conversation between the pair, creating it on first contact.
    ///
    /// The pair is unordered at the storage level: a unique index over
    /// `(min(client, trainer), max(client, trainer))` makes two racing first
    /// contacts converge on one row. A constraint violation on insert means
    /// someone else won the race, so the lookup is retried once.
    pub fn create_or_get_conversation(
        &self,
        client_id: &str,
        trainer_id: &str,
    ) -> Result<Conversation> {
        if client_id.trim().is_empty() || trainer_id.trim().is_empty() {
            return Err(StoreError::Validation("participant ids must not be empty".into()));
        }
        if client_id == trainer_id {
            return Err(StoreError::Validation(
                "a user cannot open a conversation with themselves".into(),
            ));
        }

        self.ensure_slot_role(client_id, Role::Client)?;
        self.ensure_slot_role(trainer_id, Role::Trainer)?;

        if let Some(existing) = self.find_conversation_between(client_id, trainer_id)? {
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = self.conn().execute(
            "INSERT INTO conversations (id, client_id, trainer_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                client_id,
                trainer_id,
                ConversationStatus::Active.as_str(),
                format_ts(&now),
            ],
        );

        match inserted {
            Ok(_) => {
                tracing::debug!(conversation = %id, client = client_id, trainer = trainer_id, "conversation created");
                load_conversation(self.conn(), id)
            }
            Err(e) if is_constraint_violation(&e) => {
                tracing::debug!(client = client_id, trainer = trainer_id, "first-contact race, re-reading");
                self.find_conversation_between(client_id, trainer_id)?
                    .ok_or_else(|| StoreError::Conflict(format!("first contact failed: {e}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A known user may only take the slot matching their recorded role.
    /// Users with no row yet are accepted as-is.
    fn ensure_slot_role(&self, user_id: &str, slot: Role) -> Result<()> {
        match self.user_role(user_id)? {
            Some(role) if role != slot => Err(StoreError::Validation(format!(
                "user {user_id} is a {role}, not a {slot}"
            ))),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn find_conversation_between(&self, a: &str, b: &str) -> Result<Option<Conversation>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c
             WHERE min(c.client_id, c.trainer_id) = min(?1, ?2)
               AND max(c.client_id, c.trainer_id) = max(?1, ?2)"
        );
        let found = self
            .conn()
            .query_row(&sql, params![a, b], row_to_conversation)
            .optional()?;
        Ok(found)
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        load_conversation(self.conn(), id)
    }

    /// Fetch a conversation on behalf of `user_id`, who must participate.
    pub fn get_conversation_for(&self, id: Uuid, user_id: &str) -> Result<Conversation> {
        let conversation = load_conversation(self.conn(), id)?;
        ensure_participant(&conversation, user_id)?;
        Ok(conversation)
    }

    /// Conversations where `user_id` plays `role`, most recent activity first,
    /// each joined with the other participant's profile summary.
    pub fn list_conversations_for_user(
        &self,
        user_id: &str,
        role: Role,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ConversationSummary>> {
        let (own_column, other_column) = match role {
            Role::Client => ("client_id", "trainer_id"),
            Role::Trainer => ("trainer_id", "client_id"),
        };

        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS}, u.display_name, u.avatar_url
             FROM conversations c
             LEFT JOIN users u ON u.id = c.{other_column}
             WHERE c.{own_column} = ?1
             ORDER BY COALESCE(c.last_message_at, c.created_at) DESC, c.id ASC
             LIMIT ?2 OFFSET ?3"
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![user_id, limit, page_offset(page, limit)],
            |row| {
                let conversation = row_to_conversation(row)?;
                let display_name: Option<String> = row.get(10)?;
                let avatar_url: Option<String> = row.get(11)?;
                Ok((conversation, display_name, avatar_url))
            },
        )?;

        let mut summaries = Vec::new();
        for row in rows {
            let (conversation, display_name, avatar_url) = row?;
            let other_id = match role {
                Role::Client => conversation.trainer_id.clone(),
                Role::Trainer => conversation.client_id.clone(),
            };
            let unread_count = conversation.unread_for(role);
            summaries.push(ConversationSummary {
                conversation,
                other_participant: ProfileSummary {
                    user_id: other_id,
                    display_name,
                    avatar_url,
                },
                unread_count,
            });
        }
        Ok(summaries)
    }

    /// Every conversation id `user_id` takes part in, regardless of role.
    pub fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<Uuid>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM conversations WHERE client_id = ?1 OR trainer_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let raw: String = row.get(0)?;
            parse_uuid(0, &raw)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn conversation_stats(&self, id: Uuid, requester_id: &str) -> Result<ConversationStats> {
        let conversation = self.get_conversation_for(id, requester_id)?;

        let mut stmt = self.conn().prepare(
            "SELECT message_type, COUNT(*) FROM messages
             WHERE conversation_id = ?1
             GROUP BY message_type",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            let raw: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((parse_enum::<MessageType>(0, &raw)?, count as u64))
        })?;

        let mut by_type = MessageTypeCounts::default();
        let mut total_messages = 0;
        for row in rows {
            let (message_type, count) = row?;
            by_type.add(message_type, count);
            total_messages += count;
        }

        Ok(ConversationStats {
            conversation_id: id,
            total_messages,
            by_type,
            last_message_at: conversation.last_message_at,
            client_unread_count: conversation.client_unread_count,
            trainer_unread_count: conversation.trainer_unread_count,
        })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Archive, block or re-activate. Conversations are never deleted.
    pub fn set_conversation_status(
        &self,
        id: Uuid,
        requester_id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation> {
        self.get_conversation_for(id, requester_id)?;
        self.conn().execute(
            "UPDATE conversations SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        tracing::info!(conversation = %id, status = %status, by = requester_id, "conversation status changed");
        load_conversation(self.conn(), id)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load by id on any connection (including an open transaction).
pub(crate) fn load_conversation(conn: &Connection, id: Uuid) -> Result<Conversation> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1");
    conn.query_row(&sql, params![id.to_string()], row_to_conversation)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::ConversationNotFound(id),
            other => StoreError::Sqlite(other),
        })
}

pub(crate) fn ensure_participant(conversation: &Conversation, user_id: &str) -> Result<Role> {
    conversation.role_of(user_id).ok_or_else(|| {
        StoreError::Forbidden(format!(
            "user {user_id} is not a participant of conversation {}",
            conversation.id
        ))
    })
}

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let last_at_str: Option<String> = row.get(5)?;
    let total: i64 = row.get(6)?;
    let client_unread: i64 = row.get(7)?;
    let trainer_unread: i64 = row.get(8)?;
    let created_str: String = row.get(9)?;

    Ok(Conversation {
        id: parse_uuid(0, &id_str)?,
        client_id: row.get(1)?,
        trainer_id: row.get(2)?,
        status: parse_enum(3, &status_str)?,
        last_message_preview: row.get(4)?,
        last_message_at: last_at_str.map(|s| parse_ts(5, &s)).transpose()?,
        total_message_count: total as u64,
        client_unread_count: client_unread as u64,
        trainer_unread_count: trainer_unread as u64,
        created_at: parse_ts(9, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::database::test_support::temp_db;

    use super::*;

    #[test]
    fn get_or_create_is_idempotent_and_unordered() {
        let (db, _dir) = temp_db();
        let first = db.create_or_get_conversation("c1", "t1").unwrap();
        let again = db.create_or_get_conversation("c1", "t1").unwrap();
        let swapped = db.create_or_get_conversation("t1", "c1").unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.id, swapped.id);
        assert_eq!(first.status, ConversationStatus::Active);
        assert_eq!(first.total_message_count, 0);
    }

    #[test]
    fn unique_pair_index_rejects_duplicates() {
        let (db, _dir) = temp_db();
        db.create_or_get_conversation("c1", "t1").unwrap();

        let err = db
            .conn()
            .execute(
                "INSERT INTO conversations (id, client_id, trainer_id, created_at)
                 VALUES (?1, 't1', 'c1', '2024-01-01T00:00:00.000000Z')",
                params![Uuid::new_v4().to_string()],
            )
            .unwrap_err();
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn self_conversation_rejected() {
        let (db, _dir) = temp_db();
        assert!(matches!(
            db.create_or_get_conversation("u1", "u1"),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn same_role_pairs_rejected() {
        let (db, _dir) = temp_db();
        db.ensure_user("c1", Role::Client).unwrap();
        db.ensure_user("c2", Role::Client).unwrap();
        db.ensure_user("t1", Role::Trainer).unwrap();
        db.ensure_user("t2", Role::Trainer).unwrap();

        assert!(matches!(
            db.create_or_get_conversation("c1", "c2"),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            db.create_or_get_conversation("t1", "t2"),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            db.create_or_get_conversation("t1", "c1"),
            Err(StoreError::Validation(_))
        ));
        assert!(db.find_conversation_between("c1", "c2").unwrap().is_none());

        let ok = db.create_or_get_conversation("c1", "t1").unwrap();
        assert_eq!((ok.client_id.as_str(), ok.trainer_id.as_str()), ("c1", "t1"));
    }

    #[test]
    fn get_for_non_participant_is_forbidden() {
        let (db, _dir) = temp_db();
        let conv = db.create_or_get_conversation("c1", "t1").unwrap();
        assert!(matches!(
            db.get_conversation_for(conv.id, "intruder"),
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            db.get_conversation(Uuid::new_v4()),
            Err(StoreError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn listing_joins_other_participant_profile() {
        let (db, _dir) = temp_db();
        db.update_profile("t1", Role::Trainer, Some("Tess"), None).unwrap();
        db.create_or_get_conversation("c1", "t1").unwrap();
        db.create_or_get_conversation("c1", "t2").unwrap();

        let listed = db.list_conversations_for_user("c1", Role::Client, 1, 10).unwrap();
        assert_eq!(listed.len(), 2);

        let with_tess = listed
            .iter()
            .find(|s| s.other_participant.user_id == "t1")
            .unwrap();
        assert_eq!(with_tess.other_participant.display_name.as_deref(), Some("Tess"));

        let as_trainer = db.list_conversations_for_user("c1", Role::Trainer, 1, 10).unwrap();
        assert!(as_trainer.is_empty());
    }

    #[test]
    fn status_changes_require_participation() {
        let (db, _dir) = temp_db();
        let conv = db.create_or_get_conversation("c1", "t1").unwrap();

        let archived = db
            .set_conversation_status(conv.id, "t1", ConversationStatus::Archived)
            .unwrap();
        assert_eq!(archived.status, ConversationStatus::Archived);

        assert!(db
            .set_conversation_status(conv.id, "x", ConversationStatus::Blocked)
            .is_err());
    }

    #[test]
    fn conversation_ids_cover_both_roles() {
        let (db, _dir) = temp_db();
        let a = db.create_or_get_conversation("u1", "t1").unwrap();
        let b = db.create_or_get_conversation("c2", "u1").unwrap();

        let ids = db.conversation_ids_for_user("u1").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
    }
}
