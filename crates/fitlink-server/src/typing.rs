//! Per-conversation typing indicators with auto-expiry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::timers::KeyedTimers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingChange {
    pub conversation_id: Uuid,
    pub user_id: String,
    pub is_typing: bool,
}

type TypingKey = (Uuid, String);

#[derive(Default)]
struct TypingState {
    typing: HashMap<Uuid, HashSet<String>>,
    timers: KeyedTimers<TypingKey>,
}

impl TypingState {
    fn remove(&mut self, conversation_id: Uuid, user_id: &str) -> bool {
        let Some(set) = self.typing.get_mut(&conversation_id) else {
            return false;
        };
        let removed = set.remove(user_id);
        if set.is_empty() {
            self.typing.remove(&conversation_id);
        }
        removed
    }
}

/// Tracks who is typing where. Start and stop for one user/conversation
/// pair are applied and published under one lock, so a stop can never
/// overtake its start on the change stream.
#[derive(Clone)]
pub struct TypingCoordinator {
    state: Arc<Mutex<TypingState>>,
    events: mpsc::UnboundedSender<TypingChange>,
    expiry: Duration,
}

impl TypingCoordinator {
    pub fn new(expiry: Duration) -> (Self, mpsc::UnboundedReceiver<TypingChange>) {
        let (events, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            state: Arc::new(Mutex::new(TypingState::default())),
            events,
            expiry,
        };
        (coordinator, rx)
    }

    fn lock(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the user as typing and (re)arm the expiry. Publishes only when
    /// the user was not already typing here.
    pub fn start_typing(&self, user_id: &str, conversation_id: Uuid) -> bool {
        let mut state = self.lock();
        let started = state
            .typing
            .entry(conversation_id)
            .or_default()
            .insert(user_id.to_string());

        let weak = Arc::downgrade(&self.state);
        let events = self.events.clone();
        let user = user_id.to_string();
        state.timers.arm(
            (conversation_id, user_id.to_string()),
            self.expiry,
            move |generation| async move {
                expire(weak, events, conversation_id, user, generation);
            },
        );

        if started {
            send_change(&self.events, conversation_id, user_id, true);
        }
        started
    }

    /// Idempotent. Publishes only when the user was typing.
    pub fn stop_typing(&self, user_id: &str, conversation_id: Uuid) -> bool {
        let mut state = self.lock();
        state.timers.cancel(&(conversation_id, user_id.to_string()));
        let stopped = state.remove(conversation_id, user_id);
        if stopped {
            send_change(&self.events, conversation_id, user_id, false);
        }
        stopped
    }

    /// Remove the user from every typing set. Returns the conversations a
    /// stop was published for.
    pub fn clear_user(&self, user_id: &str) -> Vec<Uuid> {
        let mut state = self.lock();
        let mut conversations: Vec<Uuid> = state
            .typing
            .iter()
            .filter(|(_, users)| users.contains(user_id))
            .map(|(id, _)| *id)
            .collect();
        conversations.sort();

        for conversation_id in &conversations {
            state.timers.cancel(&(*conversation_id, user_id.to_string()));
            state.remove(*conversation_id, user_id);
            send_change(&self.events, *conversation_id, user_id, false);
        }
        conversations
    }

    #[cfg(test)]
    pub fn typing_in(&self, conversation_id: Uuid) -> Vec<String> {
        let mut users: Vec<String> = self
            .lock()
            .typing
            .get(&conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    #[cfg(test)]
    pub fn is_typing(&self, user_id: &str, conversation_id: Uuid) -> bool {
        self.lock()
            .typing
            .get(&conversation_id)
            .is_some_and(|set| set.contains(user_id))
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.timers.clear();
        state.typing.clear();
    }
}

fn expire(
    state: Weak<Mutex<TypingState>>,
    events: mpsc::UnboundedSender<TypingChange>,
    conversation_id: Uuid,
    user_id: String,
    generation: u64,
) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let key = (conversation_id, user_id);
    if !state.timers.claim(&key, generation) {
        return;
    }
    if state.remove(conversation_id, &key.1) {
        trace!(user = %key.1, conversation = %conversation_id, "Typing expired");
        send_change(&events, conversation_id, &key.1, false);
    }
}

fn send_change(
    events: &mpsc::UnboundedSender<TypingChange>,
    conversation_id: Uuid,
    user_id: &str,
    is_typing: bool,
) {
    let change = TypingChange {
        conversation_id,
        user_id: user_id.to_string(),
        is_typing,
    };
    if events.send(change).is_err() {
        trace!("Typing change dropped, no subscriber");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_secs(3);

    fn flags(rx: &mut mpsc::UnboundedReceiver<TypingChange>) -> Vec<bool> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change.is_typing);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn expires_without_stop() {
        let (typing, mut rx) = TypingCoordinator::new(EXPIRY);
        let conv = Uuid::new_v4();

        assert!(typing.start_typing("c1", conv));
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(typing.is_typing("c1", conv));
        assert_eq!(flags(&mut rx), vec![true]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!typing.is_typing("c1", conv));
        assert_eq!(flags(&mut rx), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_without_rebroadcast() {
        let (typing, mut rx) = TypingCoordinator::new(EXPIRY);
        let conv = Uuid::new_v4();

        typing.start_typing("c1", conv);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!typing.start_typing("c1", conv));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(typing.is_typing("c1", conv));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!typing.is_typing("c1", conv));
        assert_eq!(flags(&mut rx), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_cancels_expiry() {
        let (typing, mut rx) = TypingCoordinator::new(EXPIRY);
        let conv = Uuid::new_v4();

        assert!(!typing.stop_typing("c1", conv));
        typing.start_typing("c1", conv);
        assert!(typing.stop_typing("c1", conv));
        assert!(!typing.stop_typing("c1", conv));

        tokio::time::sleep(EXPIRY * 2).await;
        assert_eq!(flags(&mut rx), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_user_stops_everywhere() {
        let (typing, mut rx) = TypingCoordinator::new(EXPIRY);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        typing.start_typing("c1", a);
        typing.start_typing("c1", b);
        typing.start_typing("t1", a);
        flags(&mut rx);

        let mut cleared = typing.clear_user("c1");
        cleared.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(cleared, expected);
        assert_eq!(typing.typing_in(a), vec!["t1".to_string()]);
        assert_eq!(flags(&mut rx), vec![false, false]);

        // Cancelled timers stay silent.
        tokio::time::sleep(EXPIRY * 2).await;
        assert_eq!(flags(&mut rx), vec![false]);
    }
}
