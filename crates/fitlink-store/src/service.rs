//! Async front of the store.
//!
//! [`MessageStore`] serializes every call on one connection behind a tokio
//! mutex. Writes that other parties need to hear about are published as
//! [`StoreEvent`]s *before* the lock is released, so the event stream is in
//! exact commit order no matter how the calling tasks are scheduled.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use fitlink_shared::{ConversationStatus, Role};

use crate::database::Database;
use crate::error::Result;
use crate::models::{
    Conversation, ConversationStats, ConversationSummary, Message, NewMessage, ProfileSummary,
    ReadReceipt,
};

/// A committed write, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    MessageCreated(Message),
    MessagesDelivered {
        conversation_id: Uuid,
        receiver_id: String,
        message_ids: Vec<Uuid>,
    },
    MessagesRead(ReadReceipt),
}

#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Mutex<Database>>,
    events: Option<mpsc::UnboundedSender<StoreEvent>>,
}

impl MessageStore {
    /// A store that does not publish events.
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            events: None,
        }
    }

    /// A store plus the receiving end of its event stream.
    pub fn with_events(db: Database) -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self {
            db: Arc::new(Mutex::new(db)),
            events: Some(tx),
        };
        (store, rx)
    }

    fn publish(&self, event: StoreEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                tracing::debug!("store event dropped, no subscriber");
            }
        }
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub async fn create_or_get_conversation(
        &self,
        client_id: &str,
        trainer_id: &str,
    ) -> Result<Conversation> {
        let db = self.db.lock().await;
        db.create_or_get_conversation(client_id, trainer_id)
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.db.lock().await.get_conversation(id)
    }

    pub async fn get_conversation_for(&self, id: Uuid, user_id: &str) -> Result<Conversation> {
        self.db.lock().await.get_conversation_for(id, user_id)
    }

    pub async fn list_conversations(
        &self,
        user_id: &str,
        role: Role,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ConversationSummary>> {
        self.db
            .lock()
            .await
            .list_conversations_for_user(user_id, role, page, limit)
    }

    pub async fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<Uuid>> {
        self.db.lock().await.conversation_ids_for_user(user_id)
    }

    pub async fn set_conversation_status(
        &self,
        id: Uuid,
        requester_id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation> {
        self.db
            .lock()
            .await
            .set_conversation_status(id, requester_id, status)
    }

    pub async fn conversation_stats(
        &self,
        id: Uuid,
        requester_id: &str,
    ) -> Result<ConversationStats> {
        self.db.lock().await.conversation_stats(id, requester_id)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn send_message(&self, new: NewMessage) -> Result<Message> {
        let mut db = self.db.lock().await;
        let message = db.insert_message(&new)?;

        tracing::debug!(
            conversation = %message.conversation_id,
            message = %message.id,
            seq = message.seq,
            "message persisted"
        );

        self.publish(StoreEvent::MessageCreated(message.clone()));
        Ok(message)
    }

    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.db
            .lock()
            .await
            .list_messages(conversation_id, requester_id, page, limit)
    }

    pub async fn search_messages(
        &self,
        user_id: &str,
        query: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.db
            .lock()
            .await
            .search_messages(user_id, query, page, limit)
    }

    pub async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        receiver_id: &str,
    ) -> Result<Vec<Message>> {
        let mut db = self.db.lock().await;
        let delivered = db.mark_delivered(conversation_id, receiver_id)?;

        if !delivered.is_empty() {
            self.publish(StoreEvent::MessagesDelivered {
                conversation_id,
                receiver_id: receiver_id.to_string(),
                message_ids: delivered.iter().map(|m| m.id).collect(),
            });
        }
        Ok(delivered)
    }

    pub async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> Result<ReadReceipt> {
        let mut db = self.db.lock().await;
        let receipt = db.mark_read(conversation_id, reader_id)?;

        if receipt.count > 0 {
            self.publish(StoreEvent::MessagesRead(receipt.clone()));
        }
        Ok(receipt)
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn ensure_user(&self, user_id: &str, role: Role) -> Result<()> {
        self.db.lock().await.ensure_user(user_id, role)
    }

    pub async fn update_profile(
        &self,
        user_id: &str,
        role: Role,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<ProfileSummary> {
        self.db
            .lock()
            .await
            .update_profile(user_id, role, display_name, avatar_url)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use fitlink_shared::MessageType;

    use crate::database::test_support::temp_db;
    use crate::models::empty_metadata;

    use super::*;

    fn text(conversation_id: Uuid, from: &str, to: &str, content: &str) -> NewMessage {
        NewMessage {
            conversation_id,
            sender_id: from.into(),
            receiver_id: to.into(),
            message_type: MessageType::Text,
            content: content.into(),
            metadata: empty_metadata(),
            reply_to_message_id: None,
        }
    }

    #[tokio::test]
    async fn concurrent_first_contact_converges() {
        let (db, _dir) = temp_db();
        let store = MessageStore::new(db);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                // Half the callers pass the pair the other way round.
                if i % 2 == 0 {
                    store.create_or_get_conversation("c1", "t1").await
                } else {
                    store.create_or_get_conversation("t1", "c1").await
                }
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_sends_lose_no_increment() {
        let (db, _dir) = temp_db();
        let store = MessageStore::new(db);
        let conv = store.create_or_get_conversation("c1", "t1").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .send_message(text(conv.id, "c1", "t1", &format!("m{i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let conv = store.get_conversation(conv.id).await.unwrap();
        assert_eq!(conv.trainer_unread_count, 20);
        assert_eq!(conv.client_unread_count, 0);
        assert_eq!(conv.total_message_count, 20);
    }

    #[tokio::test]
    async fn events_follow_commit_order() {
        let (db, _dir) = temp_db();
        let (store, mut events) = MessageStore::with_events(db);
        let conv = store.create_or_get_conversation("c1", "t1").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .send_message(text(conv.id, "c1", "t1", &format!("m{i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut seqs = Vec::new();
        while let Ok(StoreEvent::MessageCreated(m)) = events.try_recv() {
            seqs.push(m.seq);
        }
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_persistence_keeps_event_order() {
        let (db, _dir) = temp_db();
        let (store, mut events) = MessageStore::with_events(db);
        let conv = store.create_or_get_conversation("c1", "t1").await.unwrap();

        // A send that stalls inside the write lock before it commits.
        let slow = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut db = store.db.lock().await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                let message = db.insert_message(&text(conv.id, "c1", "t1", "slow")).unwrap();
                store.publish(StoreEvent::MessageCreated(message.clone()));
                message
            })
        };
        tokio::task::yield_now().await;

        let mut fast = Vec::new();
        for i in 0..3 {
            let store = store.clone();
            fast.push(tokio::spawn(async move {
                store
                    .send_message(text(conv.id, "t1", "c1", &format!("fast {i}")))
                    .await
                    .unwrap()
            }));
        }

        let slow = slow.await.unwrap();
        for handle in fast {
            handle.await.unwrap();
        }
        assert_eq!(slow.seq, 1);

        let mut seen = Vec::new();
        while let Ok(StoreEvent::MessageCreated(m)) = events.try_recv() {
            seen.push((m.seq, m.content));
        }
        let seqs: Vec<u64> = seen.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(seen[0].1, "slow");
    }

    #[tokio::test]
    async fn read_event_only_when_something_changed() {
        let (db, _dir) = temp_db();
        let (store, mut events) = MessageStore::with_events(db);
        let conv = store.create_or_get_conversation("c1", "t1").await.unwrap();
        store
            .send_message(text(conv.id, "c1", "t1", "hello"))
            .await
            .unwrap();
        let _created = events.recv().await.unwrap();

        store.mark_read(conv.id, "t1").await.unwrap();
        store.mark_read(conv.id, "t1").await.unwrap();

        match events.try_recv() {
            Ok(StoreEvent::MessagesRead(receipt)) => assert_eq!(receipt.count, 1),
            other => panic!("expected read event, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }
}
