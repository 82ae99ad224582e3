//! The realtime gateway.
//!
//! Binds each authenticated connection to a user and routes its events to
//! the store, presence registry and typing coordinator. Fan-out is driven
//! by three pump tasks, one per change stream:
//!
//! - store events (`new_message`, `messages_delivered`, `messages_read`),
//!   consumed in commit order
//! - typing changes (`user_typing`)
//! - presence changes (`user_status`)
//!
//! Errors from one connection's event are reported to that connection only.

mod events;
mod rooms;
pub mod socket;


use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fitlink_store::{Message, MessageStore, NewMessage, ReadReceipt, StoreEvent};

use crate::auth::{Authenticator, Identity};
use crate::config::ServerConfig;
use crate::directory::ConversationDirectory;
use crate::error::{Result, ServerError};
use crate::notify::OfflineNotifier;
use crate::presence::{PresenceChange, PresenceRegistry};
use crate::rate_limit::RateLimiter;
use crate::typing::{TypingChange, TypingCoordinator};

pub use events::{ClientEvent, OutgoingMessage, ServerEvent};
pub use rooms::{ConnectionId, RoomRegistry};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub typing_timeout: Duration,
    pub presence_grace: Duration,
    pub send_rate: f64,
    pub send_burst: f64,
}

impl From<&ServerConfig> for GatewaySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            typing_timeout: config.typing_timeout,
            presence_grace: config.presence_grace,
            send_rate: config.send_rate,
            send_burst: config.send_burst,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

struct Inner {
    store: MessageStore,
    directory: ConversationDirectory,
    presence: PresenceRegistry,
    typing: TypingCoordinator,
    rooms: RoomRegistry,
    authenticator: Arc<dyn Authenticator>,
    send_limiter: RateLimiter<String>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Build the gateway and spawn its fan-out pumps. `store_events` must be
    /// the receiver paired with `store`.
    pub fn start(
        store: MessageStore,
        store_events: mpsc::UnboundedReceiver<StoreEvent>,
        authenticator: Arc<dyn Authenticator>,
        notifier: Arc<dyn OfflineNotifier>,
        settings: GatewaySettings,
    ) -> Self {
        let (presence, presence_events) = PresenceRegistry::new(settings.presence_grace);
        let (typing, typing_events) = TypingCoordinator::new(settings.typing_timeout);
        let rooms = RoomRegistry::new();
        let directory = ConversationDirectory::new(store.clone());

        let pumps = vec![
            tokio::spawn(run_store_pump(
                store_events,
                store.clone(),
                rooms.clone(),
                presence.clone(),
                notifier,
            )),
            tokio::spawn(run_typing_pump(typing_events, rooms.clone())),
            tokio::spawn(run_presence_pump(
                presence_events,
                directory.clone(),
                rooms.clone(),
            )),
        ];

        info!(
            typing_timeout_ms = settings.typing_timeout.as_millis() as u64,
            presence_grace_secs = settings.presence_grace.as_secs(),
            "Realtime gateway started"
        );

        Self {
            inner: Arc::new(Inner {
                store,
                directory,
                presence,
                typing,
                rooms,
                authenticator,
                send_limiter: RateLimiter::new(settings.send_rate, settings.send_burst),
                pumps: Mutex::new(pumps),
            }),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.inner.directory
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    #[cfg(test)]
    pub fn typing(&self) -> &TypingCoordinator {
        &self.inner.typing
    }

    #[cfg(test)]
    pub fn rooms(&self) -> &RoomRegistry {
        &self.inner.rooms
    }

    pub fn send_limiter(&self) -> &RateLimiter<String> {
        &self.inner.send_limiter
    }

    pub fn authenticate(&self, credential: &str) -> Result<Identity> {
        self.inner.authenticator.authenticate(credential)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Enter the `connected` state: register the connection, acknowledge it
    /// and mark the user online.
    pub async fn connect(&self, identity: Identity) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        if let Err(e) = self
            .inner
            .store
            .ensure_user(&identity.user_id, identity.role)
            .await
        {
            warn!(user = %identity.user_id, error = %e, "Failed to record user");
        }

        let (connection_id, rx) = self.inner.rooms.register(identity.clone()).await;
        self.inner
            .rooms
            .send_to(
                connection_id,
                ServerEvent::Authenticated {
                    user_id: identity.user_id.clone(),
                    role: identity.role,
                    connection_id,
                },
            )
            .await;

        self.inner
            .presence
            .mark_online(&identity.user_id, connection_id, identity.role);

        (connection_id, rx)
    }

    /// Leave the `connected` state. Typing is cleared at once; going offline
    /// waits for the grace period unless another connection of the same user
    /// is still open, in which case it takes over presence.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some((identity, _rooms)) = self.inner.rooms.unregister(connection_id).await else {
            return;
        };

        self.inner.typing.clear_user(&identity.user_id);

        let remaining = self
            .inner
            .rooms
            .connections_for_user(&identity.user_id)
            .await;
        match remaining.last() {
            Some(newest) => {
                self.inner
                    .presence
                    .mark_online(&identity.user_id, *newest, identity.role);
            }
            None => {
                self.inner
                    .presence
                    .schedule_offline(&identity.user_id, connection_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Per-event error boundary: failures go back to this connection only.
    pub async fn handle(&self, connection_id: ConnectionId, event: ClientEvent) {
        let Some(identity) = self.inner.rooms.identity_of(connection_id).await else {
            debug!(connection = %connection_id, "Event for unknown connection");
            return;
        };

        if let Err(e) = self.dispatch(connection_id, &identity, event).await {
            debug!(
                user = %identity.user_id,
                connection = %connection_id,
                code = e.code(),
                error = %e,
                "Event rejected"
            );
            self.reply_error(connection_id, &e).await;
        }
    }

    pub async fn reply_error(&self, connection_id: ConnectionId, err: &ServerError) {
        self.inner
            .rooms
            .send_to(connection_id, ServerEvent::error(err))
            .await;
    }

    async fn dispatch(
        &self,
        connection_id: ConnectionId,
        identity: &Identity,
        event: ClientEvent,
    ) -> Result<()> {
        let rooms = &self.inner.rooms;

        match event {
            ClientEvent::Authenticate { .. } => {
                debug!(connection = %connection_id, "Already authenticated, ignoring");
            }

            ClientEvent::JoinConversation { conversation_id } => {
                self.inner
                    .store
                    .get_conversation_for(conversation_id, &identity.user_id)
                    .await?;
                rooms.join(connection_id, conversation_id).await;

                let delivered = self
                    .inner
                    .store
                    .mark_delivered(conversation_id, &identity.user_id)
                    .await?;
                rooms
                    .send_to(
                        connection_id,
                        ServerEvent::JoinedConversation {
                            conversation_id,
                            delivered,
                        },
                    )
                    .await;
            }

            ClientEvent::LeaveConversation { conversation_id } => {
                rooms.leave(connection_id, conversation_id).await;
                self.inner
                    .typing
                    .stop_typing(&identity.user_id, conversation_id);
                rooms
                    .send_to(
                        connection_id,
                        ServerEvent::LeftConversation { conversation_id },
                    )
                    .await;
            }

            ClientEvent::SendMessage {
                conversation_id,
                message,
            } => {
                if !self
                    .inner
                    .send_limiter
                    .check(identity.user_id.clone())
                    .await
                {
                    return Err(ServerError::RateLimited);
                }

                let client_ref = message.client_ref.clone();
                let message = self.send_message(identity, conversation_id, message).await?;
                rooms
                    .send_to(connection_id, ServerEvent::MessageSent { client_ref, message })
                    .await;
            }

            ClientEvent::TypingStart { conversation_id } => {
                if rooms.is_member(connection_id, conversation_id).await {
                    self.inner
                        .typing
                        .start_typing(&identity.user_id, conversation_id);
                } else {
                    debug!(
                        user = %identity.user_id,
                        conversation = %conversation_id,
                        "Typing in a room not joined, ignoring"
                    );
                }
            }

            ClientEvent::TypingStop { conversation_id } => {
                self.inner
                    .typing
                    .stop_typing(&identity.user_id, conversation_id);
            }

            ClientEvent::MarkRead { conversation_id } => {
                if let Err(e) = self.mark_read(identity, conversation_id).await {
                    warn!(
                        user = %identity.user_id,
                        conversation = %conversation_id,
                        error = %e,
                        "Mark read failed"
                    );
                }
            }

            ClientEvent::GetOnlineUsers { conversation_id } => {
                let conversation = self
                    .inner
                    .store
                    .get_conversation_for(conversation_id, &identity.user_id)
                    .await?;
                let user_ids = self
                    .inner
                    .presence
                    .online_users_in(conversation_id, &conversation.participant_ids());
                rooms
                    .send_to(
                        connection_id,
                        ServerEvent::OnlineUsers {
                            conversation_id,
                            user_ids,
                        },
                    )
                    .await;
            }

            ClientEvent::Ping => {
                rooms.send_to(connection_id, ServerEvent::Pong).await;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Operations shared with the HTTP API
    // ------------------------------------------------------------------

    /// Persist a message. Fan-out happens on the store pump once the write
    /// commits.
    pub async fn send_message(
        &self,
        identity: &Identity,
        conversation_id: Uuid,
        outgoing: OutgoingMessage,
    ) -> Result<Message> {
        let conversation = self
            .inner
            .store
            .get_conversation_for(conversation_id, &identity.user_id)
            .await?;

        let receiver_id = match outgoing.receiver_id {
            Some(receiver_id) => receiver_id,
            None => conversation
                .other_participant(&identity.user_id)
                .unwrap_or_default()
                .to_string(),
        };

        let message = self
            .inner
            .store
            .send_message(NewMessage {
                conversation_id,
                sender_id: identity.user_id.clone(),
                receiver_id,
                message_type: outgoing.message_type,
                content: outgoing.content,
                metadata: outgoing.metadata,
                reply_to_message_id: outgoing.reply_to_message_id,
            })
            .await?;

        self.inner
            .typing
            .stop_typing(&identity.user_id, conversation_id);
        Ok(message)
    }

    pub async fn mark_read(&self, identity: &Identity, conversation_id: Uuid) -> Result<ReadReceipt> {
        Ok(self
            .inner
            .store
            .mark_read(conversation_id, &identity.user_id)
            .await?)
    }

    /// Stop the pumps, cancel every timer and drop all connections.
    pub async fn shutdown(&self) {
        let pumps: Vec<JoinHandle<()>> = self
            .inner
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for pump in pumps {
            pump.abort();
        }

        self.inner.typing.clear();
        self.inner.presence.clear();
        self.inner.rooms.clear().await;
        info!("Realtime gateway stopped");
    }
}

// ----------------------------------------------------------------------
// Fan-out pumps
// ----------------------------------------------------------------------

async fn run_store_pump(
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
    store: MessageStore,
    rooms: RoomRegistry,
    presence: PresenceRegistry,
    notifier: Arc<dyn OfflineNotifier>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StoreEvent::MessageCreated(message) => {
                let conversation_id = message.conversation_id;
                rooms
                    .broadcast(
                        conversation_id,
                        &ServerEvent::NewMessage {
                            message: message.clone(),
                        },
                        None,
                    )
                    .await;

                let receiver_id = message.receiver_id.clone();
                if rooms.is_user_in_room(conversation_id, &receiver_id).await {
                    if let Err(e) = store.mark_delivered(conversation_id, &receiver_id).await {
                        warn!(conversation = %conversation_id, error = %e, "Mark delivered failed");
                    }
                } else if !presence.is_online(&receiver_id) {
                    let notifier = notifier.clone();
                    tokio::spawn(async move {
                        if let Err(e) = notifier.notify(&message, &receiver_id).await {
                            warn!(
                                recipient = %receiver_id,
                                message = %message.id,
                                error = %e,
                                "Offline notification failed"
                            );
                        }
                    });
                }
            }

            StoreEvent::MessagesDelivered {
                conversation_id,
                receiver_id,
                message_ids,
            } => {
                let event = ServerEvent::MessagesDelivered {
                    conversation_id,
                    receiver_id: receiver_id.clone(),
                    message_ids,
                };
                rooms
                    .broadcast(conversation_id, &event, Some(receiver_id.as_str()))
                    .await;
            }

            StoreEvent::MessagesRead(receipt) => {
                let event = ServerEvent::MessagesRead {
                    conversation_id: receipt.conversation_id,
                    reader_id: receipt.reader_id.clone(),
                    read_at: receipt.read_at,
                    count: receipt.count,
                };
                rooms
                    .broadcast(receipt.conversation_id, &event, Some(receipt.reader_id.as_str()))
                    .await;
            }
        }
    }
    debug!("Store event stream closed");
}

async fn run_typing_pump(mut events: mpsc::UnboundedReceiver<TypingChange>, rooms: RoomRegistry) {
    while let Some(change) = events.recv().await {
        let event = ServerEvent::UserTyping {
            conversation_id: change.conversation_id,
            user_id: change.user_id.clone(),
            is_typing: change.is_typing,
        };
        rooms
            .broadcast(change.conversation_id, &event, Some(change.user_id.as_str()))
            .await;
    }
}

async fn run_presence_pump(
    mut events: mpsc::UnboundedReceiver<PresenceChange>,
    directory: ConversationDirectory,
    rooms: RoomRegistry,
) {
    while let Some(change) = events.recv().await {
        let conversations = match directory.conversation_ids_for(&change.user_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(user = %change.user_id, error = %e, "Presence fan-out skipped");
                continue;
            }
        };

        let event = ServerEvent::UserStatus {
            user_id: change.user_id.clone(),
            is_online: change.is_online,
            last_seen_at: change.last_seen_at,
        };
        for conversation_id in conversations {
            rooms
                .broadcast(conversation_id, &event, Some(change.user_id.as_str()))
                .await;
        }
    }
}
