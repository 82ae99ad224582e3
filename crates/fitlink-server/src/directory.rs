//! Conversation lookup and creation on behalf of an authenticated user.

use serde::Deserialize;
use uuid::Uuid;

use fitlink_shared::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use fitlink_shared::Role;
use fitlink_store::{Conversation, ConversationSummary, MessageStore};

use crate::auth::Identity;
use crate::error::Result;

/// `?page=&limit=` as sent by callers. `page` is 1-based.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Pagination {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl Pagination {
    /// Apply defaults and bounds: page 0 is page 1, limit falls in
    /// `1..=MAX_PAGE_SIZE`.
    pub fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        (page, limit)
    }
}

#[derive(Clone)]
pub struct ConversationDirectory {
    store: MessageStore,
}

impl ConversationDirectory {
    pub fn new(store: MessageStore) -> Self {
        Self { store }
    }

    /// Get or create the conversation between the caller and
    /// `participant_id`. The caller's role decides which side they sit on;
    /// a participant already known in the same role is rejected.
    pub async fn open(&self, identity: &Identity, participant_id: &str) -> Result<Conversation> {
        let (client_id, trainer_id) = match identity.role {
            Role::Client => (identity.user_id.as_str(), participant_id),
            Role::Trainer => (participant_id, identity.user_id.as_str()),
        };
        Ok(self
            .store
            .create_or_get_conversation(client_id, trainer_id)
            .await?)
    }

    pub async fn list(
        &self,
        identity: &Identity,
        pagination: Pagination,
    ) -> Result<Vec<ConversationSummary>> {
        let (page, limit) = pagination.resolve();
        Ok(self
            .store
            .list_conversations(&identity.user_id, identity.role, page, limit)
            .await?)
    }

    pub async fn conversation_ids_for(&self, user_id: &str) -> Result<Vec<Uuid>> {
        Ok(self.store.conversation_ids_for_user(user_id).await?)
    }
}
