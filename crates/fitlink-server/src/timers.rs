//! Cancelable delayed tasks keyed by an arbitrary scope.
//!
//! Arming a key that already has a pending timer aborts the old one first,
//! so at most one timer per key is ever live. Every arm gets a fresh
//! generation number; the firing task must [`KeyedTimers::claim`] its
//! generation under the owner's lock before acting. A timer that was
//! replaced or cancelled while already running fails the claim and does
//! nothing.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct KeyedTimers<K> {
    next_generation: u64,
    pending: HashMap<K, Pending>,
}

impl<K: Eq + Hash> KeyedTimers<K> {
    pub fn new() -> Self {
        Self {
            next_generation: 0,
            pending: HashMap::new(),
        }
    }

    /// Schedule `on_fire` after `delay`, replacing any timer for `key`.
    /// Returns the generation handed to `on_fire`.
    pub fn arm<F, Fut>(&mut self, key: K, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(&key);

        self.next_generation += 1;
        let generation = self.next_generation;
        let fire = on_fire(generation);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        });

        self.pending.insert(key, Pending { generation, handle });
        generation
    }

    /// Abort the pending timer for `key`. Returns whether one existed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.pending.remove(key) {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Called by a firing timer. Succeeds only if `generation` is still the
    /// live timer for `key`, and retires it.
    pub fn claim(&mut self, key: &K, generation: u64) -> bool {
        match self.pending.get(key) {
            Some(pending) if pending.generation == generation => {
                self.pending.remove(key);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Abort every pending timer.
    pub fn clear(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.handle.abort();
        }
    }
}

impl<K: Eq + Hash> Default for KeyedTimers<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for KeyedTimers<K> {
    fn drop(&mut self) {
        for pending in self.pending.values() {
            pending.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Fired = Arc<Mutex<Vec<&'static str>>>;

    fn arm(timers: &Arc<Mutex<KeyedTimers<&'static str>>>, fired: &Fired, key: &'static str, ms: u64) {
        let shared = timers.clone();
        let fired = fired.clone();
        timers
            .lock()
            .unwrap()
            .arm(key, Duration::from_millis(ms), move |generation| async move {
                if shared.lock().unwrap().claim(&key, generation) {
                    fired.lock().unwrap().push(key);
                }
            });
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timers = Arc::new(Mutex::new(KeyedTimers::new()));
        let fired: Fired = Arc::default();

        arm(&timers, &fired, "a", 100);
        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*fired.lock().unwrap(), vec!["a"]);
        assert!(timers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_instead_of_stacking() {
        let timers = Arc::new(Mutex::new(KeyedTimers::new()));
        let fired: Fired = Arc::default();

        arm(&timers, &fired, "a", 100);
        tokio::time::sleep(Duration::from_millis(60)).await;
        arm(&timers, &fired, "a", 100);
        assert_eq!(timers.lock().unwrap().len(), 1);

        // The first timer's deadline passes without effect.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*fired.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timers = Arc::new(Mutex::new(KeyedTimers::new()));
        let fired: Fired = Arc::default();

        arm(&timers, &fired, "a", 100);
        arm(&timers, &fired, "b", 100);
        assert!(timers.lock().unwrap().cancel(&"a"));
        assert!(!timers.lock().unwrap().cancel(&"a"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*fired.lock().unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn stale_generation_cannot_claim() {
        let mut timers = KeyedTimers::new();
        let first = timers.arm("k", Duration::from_secs(10), |_| async {});
        let second = timers.arm("k", Duration::from_secs(10), |_| async {});

        assert!(!timers.claim(&"k", first));
        assert!(timers.claim(&"k", second));
        assert!(!timers.is_armed(&"k"));
    }
}
