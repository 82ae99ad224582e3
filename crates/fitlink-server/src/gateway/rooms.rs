use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::events::ServerEvent;
use crate::auth::Identity;

pub type ConnectionId = Uuid;

/// Outbound queue depth per connection. Events for a connection that falls
/// this far behind are dropped.
const OUTBOUND_BUFFER: usize = 256;

struct Connection {
    identity: Identity,
    tx: mpsc::Sender<ServerEvent>,
    rooms: HashSet<Uuid>,
    opened: u64,
}

#[derive(Default)]
struct Rooms {
    connections: HashMap<ConnectionId, Connection>,
    members: HashMap<Uuid, HashSet<ConnectionId>>,
    next_order: u64,
}

/// Live connections and the conversation rooms they have joined.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<Rooms>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, identity: Identity) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let connection_id = Uuid::new_v4();

        let mut inner = self.inner.write().await;
        inner.next_order += 1;
        let opened = inner.next_order;
        info!(
            user = %identity.user_id,
            connection = %connection_id,
            "Connection registered"
        );
        inner.connections.insert(
            connection_id,
            Connection {
                identity,
                tx,
                rooms: HashSet::new(),
                opened,
            },
        );

        (connection_id, rx)
    }

    /// Remove the connection from the registry and every room it joined.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<(Identity, Vec<Uuid>)> {
        let mut inner = self.inner.write().await;
        let connection = inner.connections.remove(&connection_id)?;

        for room in &connection.rooms {
            let empty = match inner.members.get_mut(room) {
                Some(members) => {
                    members.remove(&connection_id);
                    members.is_empty()
                }
                None => false,
            };
            if empty {
                inner.members.remove(room);
            }
        }

        info!(
            user = %connection.identity.user_id,
            connection = %connection_id,
            "Connection unregistered"
        );
        Some((connection.identity, connection.rooms.into_iter().collect()))
    }

    /// Returns `false` when the connection is unknown.
    pub async fn join(&self, connection_id: ConnectionId, conversation_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let Some(connection) = inner.connections.get_mut(&connection_id) else {
            return false;
        };
        connection.rooms.insert(conversation_id);
        let members = inner.members.entry(conversation_id).or_default();
        members.insert(connection_id);

        debug!(
            room = %conversation_id,
            connection = %connection_id,
            members = members.len(),
            "Joined room"
        );
        true
    }

    /// Returns whether the connection was a member.
    pub async fn leave(&self, connection_id: ConnectionId, conversation_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let was_member = inner
            .connections
            .get_mut(&connection_id)
            .is_some_and(|c| c.rooms.remove(&conversation_id));

        let empty = match inner.members.get_mut(&conversation_id) {
            Some(members) => {
                members.remove(&connection_id);
                members.is_empty()
            }
            None => false,
        };
        if empty {
            inner.members.remove(&conversation_id);
        }

        was_member
    }

    pub async fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let inner = self.inner.read().await;
        match inner.connections.get(&connection_id) {
            Some(connection) => deliver(connection_id, connection, event),
            None => false,
        }
    }

    /// Send to every connection joined to the room, optionally skipping all
    /// connections of one user. Returns the number of connections reached.
    pub async fn broadcast(
        &self,
        conversation_id: Uuid,
        event: &ServerEvent,
        exclude_user: Option<&str>,
    ) -> usize {
        let inner = self.inner.read().await;
        let Some(members) = inner.members.get(&conversation_id) else {
            return 0;
        };

        let mut reached = 0;
        for connection_id in members {
            let Some(connection) = inner.connections.get(connection_id) else {
                continue;
            };
            if exclude_user.is_some_and(|u| u == connection.identity.user_id) {
                continue;
            }
            if deliver(*connection_id, connection, event.clone()) {
                reached += 1;
            }
        }
        reached
    }

    /// The user's live connections, oldest first.
    pub async fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        let mut found: Vec<(u64, ConnectionId)> = inner
            .connections
            .iter()
            .filter(|(_, c)| c.identity.user_id == user_id)
            .map(|(id, c)| (c.opened, *id))
            .collect();
        found.sort();
        found.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn is_user_in_room(&self, conversation_id: Uuid, user_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner.members.get(&conversation_id).is_some_and(|members| {
            members.iter().any(|id| {
                inner
                    .connections
                    .get(id)
                    .is_some_and(|c| c.identity.user_id == user_id)
            })
        })
    }

    pub async fn is_member(&self, connection_id: ConnectionId, conversation_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .is_some_and(|c| c.rooms.contains(&conversation_id))
    }

    pub async fn identity_of(&self, connection_id: ConnectionId) -> Option<Identity> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|c| c.identity.clone())
    }

    #[cfg(test)]
    pub async fn room_size(&self, conversation_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .members
            .get(&conversation_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Drop every connection; their outbound queues close.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.connections.clear();
        inner.members.clear();
    }
}

fn deliver(connection_id: ConnectionId, connection: &Connection, event: ServerEvent) -> bool {
    match connection.tx.try_send(event) {
        Ok(()) => true,
        Err(_) => {
            debug!(
                connection = %connection_id,
                user = %connection.identity.user_id,
                "Dropping event for slow or closed connection"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use fitlink_shared::Role;

    use super::*;

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.into(),
            role: Role::Client,
        }
    }

    #[tokio::test]
    async fn test_room_join_leave() {
        let rooms = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (conn, _rx) = rooms.register(identity("c1")).await;

        assert!(rooms.join(conn, room).await);
        assert_eq!(rooms.room_size(room).await, 1);
        assert!(rooms.is_user_in_room(room, "c1").await);

        assert!(rooms.leave(conn, room).await);
        assert!(!rooms.leave(conn, room).await);
        assert_eq!(rooms.room_size(room).await, 0);

        assert!(!rooms.join(Uuid::new_v4(), room).await);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_user() {
        let rooms = RoomRegistry::new();
        let room = Uuid::new_v4();

        let (sender, mut sender_rx) = rooms.register(identity("c1")).await;
        let (other_tab, mut other_tab_rx) = rooms.register(identity("c1")).await;
        let (receiver, mut receiver_rx) = rooms.register(identity("t1")).await;
        for conn in [sender, other_tab, receiver] {
            rooms.join(conn, room).await;
        }

        let reached = rooms.broadcast(room, &ServerEvent::Pong, Some("c1")).await;
        assert_eq!(reached, 1);
        assert_eq!(receiver_rx.try_recv().unwrap(), ServerEvent::Pong);
        assert!(sender_rx.try_recv().is_err());
        assert!(other_tab_rx.try_recv().is_err());

        assert_eq!(rooms.broadcast(room, &ServerEvent::Pong, None).await, 3);
    }

    #[tokio::test]
    async fn test_unregister_cleans_rooms() {
        let rooms = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (first, _a) = rooms.register(identity("c1")).await;
        let (second, _b) = rooms.register(identity("c1")).await;
        rooms.join(first, room).await;

        assert_eq!(rooms.connections_for_user("c1").await, vec![first, second]);

        let (who, joined) = rooms.unregister(first).await.unwrap();
        assert_eq!(who.user_id, "c1");
        assert_eq!(joined, vec![room]);
        assert_eq!(rooms.room_size(room).await, 0);
        assert_eq!(rooms.connections_for_user("c1").await, vec![second]);
        assert!(rooms.unregister(first).await.is_none());
    }
}
