//! In-memory presence registry.
//!
//! One entry per user, owned by the connection that most recently came
//! online. Going offline after a disconnect is deferred by a grace period
//! so that a reload does not flap the status seen by the other party.
//! State changes are published on an unbounded channel in the order they
//! happen; the gateway turns them into `user_status` broadcasts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use fitlink_shared::Role;

use crate::timers::KeyedTimers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection_id: Uuid,
    pub role: Role,
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// An online/offline transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Default)]
struct PresenceState {
    entries: HashMap<String, PresenceEntry>,
    grace_timers: KeyedTimers<String>,
}

#[derive(Clone)]
pub struct PresenceRegistry {
    state: Arc<Mutex<PresenceState>>,
    events: mpsc::UnboundedSender<PresenceChange>,
    grace: Duration,
}

impl PresenceRegistry {
    pub fn new(grace: Duration) -> (Self, mpsc::UnboundedReceiver<PresenceChange>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            state: Arc::new(Mutex::new(PresenceState::default())),
            events,
            grace,
        };
        (registry, rx)
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `connection_id` as the user's presence holder. Cancels any
    /// pending offline flip. Returns `true` (and publishes) only when the
    /// user was not already online.
    pub fn mark_online(&self, user_id: &str, connection_id: Uuid, role: Role) -> bool {
        let mut state = self.lock();
        if state.grace_timers.cancel(&user_id.to_string()) {
            debug!(user = user_id, "Reconnected within grace period");
        }

        let now = Utc::now();
        let was_online = state
            .entries
            .get(user_id)
            .map(|e| e.is_online)
            .unwrap_or(false);

        state.entries.insert(
            user_id.to_string(),
            PresenceEntry {
                connection_id,
                role,
                is_online: true,
                last_seen_at: now,
            },
        );

        if !was_online {
            self.publish(user_id, true, now);
        }
        !was_online
    }

    /// Start the grace timer after `connection_id` went away. Ignored when
    /// that connection no longer holds the user's presence. Re-scheduling
    /// replaces the previous timer.
    pub fn schedule_offline(&self, user_id: &str, connection_id: Uuid) -> bool {
        let mut state = self.lock();
        let holds_presence = state
            .entries
            .get(user_id)
            .is_some_and(|e| e.is_online && e.connection_id == connection_id);
        if !holds_presence {
            trace!(user = user_id, connection = %connection_id, "Superseded connection, offline not scheduled");
            return false;
        }

        let weak = Arc::downgrade(&self.state);
        let events = self.events.clone();
        let key = user_id.to_string();
        state
            .grace_timers
            .arm(key.clone(), self.grace, move |generation| async move {
                expire(weak, events, key, generation);
            });

        debug!(user = user_id, grace_secs = self.grace.as_secs(), "Offline scheduled");
        true
    }

    /// Flip the user offline immediately. No-op if already offline.
    #[cfg(test)]
    pub fn mark_offline(&self, user_id: &str) -> bool {
        let mut state = self.lock();
        state.grace_timers.cancel(&user_id.to_string());
        let changed = go_offline(&mut state, user_id);
        if let Some(at) = changed {
            self.publish(user_id, false, at);
        }
        changed.is_some()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.lock()
            .entries
            .get(user_id)
            .is_some_and(|e| e.is_online)
    }

    #[cfg(test)]
    pub fn entry(&self, user_id: &str) -> Option<PresenceEntry> {
        self.lock().entries.get(user_id).cloned()
    }

    /// The subset of `participant_ids` that is online right now.
    pub fn online_users_in(&self, conversation_id: Uuid, participant_ids: &[&str]) -> Vec<String> {
        let state = self.lock();
        let online: Vec<String> = participant_ids
            .iter()
            .filter(|id| state.entries.get(**id).is_some_and(|e| e.is_online))
            .map(|id| id.to_string())
            .collect();
        trace!(conversation = %conversation_id, online = online.len(), "Online users query");
        online
    }

    /// Drop offline entries last seen more than `retention` ago.
    pub fn purge_offline(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| {
            e.is_online
                || (now - e.last_seen_at)
                    .to_std()
                    .map_or(true, |age| age < retention)
        });
        before - state.entries.len()
    }

    /// Cancel all grace timers and forget every entry.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.grace_timers.clear();
        state.entries.clear();
    }

    fn publish(&self, user_id: &str, is_online: bool, at: DateTime<Utc>) {
        send_change(&self.events, user_id, is_online, at);
    }
}

fn go_offline(state: &mut PresenceState, user_id: &str) -> Option<DateTime<Utc>> {
    let entry = state.entries.get_mut(user_id)?;
    if !entry.is_online {
        return None;
    }
    let now = Utc::now();
    entry.is_online = false;
    entry.last_seen_at = now;
    Some(now)
}

fn expire(
    state: Weak<Mutex<PresenceState>>,
    events: mpsc::UnboundedSender<PresenceChange>,
    user_id: String,
    generation: u64,
) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if !state.grace_timers.claim(&user_id, generation) {
        return;
    }
    if let Some(at) = go_offline(&mut state, &user_id) {
        debug!(user = %user_id, "Grace period elapsed, user offline");
        send_change(&events, &user_id, false, at);
    }
}

fn send_change(
    events: &mpsc::UnboundedSender<PresenceChange>,
    user_id: &str,
    is_online: bool,
    last_seen_at: DateTime<Utc>,
) {
    let change = PresenceChange {
        user_id: user_id.to_string(),
        is_online,
        last_seen_at,
    };
    if events.send(change).is_err() {
        trace!(user = user_id, "Presence change dropped, no subscriber");
    }
}
