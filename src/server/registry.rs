//! Live client sessions and the count they are all being shown.
//!
//! One registry exists per server process. Handlers receive it through axum
//! state; it dies with the server.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::state::SpecialAnimation;
use crate::topics::{CountChanged, SessionId};

pub const DEFAULT_UNCHANGED_WINDOW: Duration = Duration::from_secs(5);

const CHANNEL_CAPACITY: usize = 256;

/// Outcome of a submitted count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submitted {
    Broadcast { recipients: usize },
    /// Same value as the current one, submitted again within the window.
    Unchanged,
}

/// A session's view at the moment it joined.
pub struct Joined {
    pub id: SessionId,
    pub updates: broadcast::Receiver<CountChanged>,
    pub count: i64,
    pub special: SpecialAnimation,
}

pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    tx: broadcast::Sender<CountChanged>,
    next_session: AtomicU64,
    unchanged_window: Duration,
}

struct RegistryState {
    count: i64,
    last_update: Instant,
    special: SpecialAnimation,
    sessions: HashSet<SessionId>,
}

impl SessionRegistry {
    pub fn new(initial: i64, unchanged_window: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(RegistryState {
                count: initial,
                last_update: Instant::now(),
                special: SpecialAnimation::idle(),
                sessions: HashSet::new(),
            }),
            tx,
            next_session: AtomicU64::new(1),
            unchanged_window,
        }
    }

    /// Register a session. The receiver is subscribed under the same lock the
    /// count is read with, so nothing sent afterwards is missed.
    pub fn join(&self) -> Joined {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock();
        state.sessions.insert(id);
        Joined {
            id,
            updates: self.tx.subscribe(),
            count: state.count,
            special: state.special.clone(),
        }
    }

    pub fn leave(&self, id: SessionId) {
        self.state.lock().sessions.remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn current(&self) -> i64 {
        self.state.lock().count
    }

    /// A count posted to the broadcast endpoint. Re-posting the current value
    /// shortly after the last update is acknowledged without a broadcast.
    pub fn submit(&self, value: i64) -> Submitted {
        let mut state = self.state.lock();
        let now = Instant::now();
        if value == state.count && now.duration_since(state.last_update) <= self.unchanged_window {
            return Submitted::Unchanged;
        }
        state.count = value;
        state.last_update = now;
        let recipients = self.send(CountChanged::Count {
            value,
            origin: None,
        });
        Submitted::Broadcast { recipients }
    }

    /// A count sent by a relay session; fanned out to everyone else.
    pub fn relay(&self, value: i64, from: SessionId) -> usize {
        let mut state = self.state.lock();
        state.count = value;
        state.last_update = Instant::now();
        self.send(CountChanged::Count {
            value,
            origin: Some(from),
        })
    }

    /// A count committed to the store, possibly by another process. Values the
    /// sessions already have are not sent again.
    pub fn observe(&self, value: i64) -> bool {
        let mut state = self.state.lock();
        if state.count == value {
            return false;
        }
        state.count = value;
        state.last_update = Instant::now();
        self.send(CountChanged::Count {
            value,
            origin: None,
        });
        true
    }

    pub fn observe_special(&self, special: SpecialAnimation) -> bool {
        let mut state = self.state.lock();
        if state.special == special {
            return false;
        }
        state.special = special.clone();
        self.send(CountChanged::Special(special));
        true
    }

    fn send(&self, msg: CountChanged) -> usize {
        // No receivers is fine; nobody is watching yet.
        let recipients = self.tx.send(msg).unwrap_or(0);
        debug!(recipients, "Fanned out update");
        recipients
    }
}

/// Removes its session from the registry when dropped, i.e. when the SSE
/// stream or socket task that owns it goes away.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl SessionGuard {
    pub fn new(registry: Arc<SessionRegistry>, id: SessionId) -> Self {
        Self { registry, id }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.leave(self.id);
        debug!(session = %self.id, clients = self.registry.client_count(), "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unchanged_value_within_window_is_not_rebroadcast() {
        let registry = SessionRegistry::new(0, DEFAULT_UNCHANGED_WINDOW);
        let mut joined = registry.join();

        assert_eq!(registry.submit(10), Submitted::Broadcast { recipients: 1 });
        assert_eq!(registry.submit(10), Submitted::Unchanged);
        assert_eq!(
            joined.updates.recv().await.unwrap(),
            CountChanged::Count { value: 10, origin: None }
        );
        assert!(joined.updates.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(registry.submit(10), Submitted::Broadcast { .. }));
    }

    #[test]
    fn join_sees_current_state() {
        let registry = SessionRegistry::new(7, DEFAULT_UNCHANGED_WINDOW);
        registry.observe_special(SpecialAnimation::announcing(None, Some(1)));
        let joined = registry.join();
        assert_eq!(joined.count, 7);
        assert!(joined.special.active);
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn relay_tags_origin() {
        let registry = SessionRegistry::new(0, DEFAULT_UNCHANGED_WINDOW);
        let a = registry.join();
        let mut b = registry.join();
        registry.relay(5, a.id);
        assert_eq!(
            b.updates.try_recv().unwrap(),
            CountChanged::Count { value: 5, origin: Some(a.id) }
        );
    }

    #[test]
    fn observe_dedups_by_value() {
        let registry = SessionRegistry::new(3, DEFAULT_UNCHANGED_WINDOW);
        assert!(!registry.observe(3));
        assert!(registry.observe(4));
        assert_eq!(registry.current(), 4);
    }

    #[test]
    fn guard_removes_session_on_drop() {
        let registry = Arc::new(SessionRegistry::new(0, DEFAULT_UNCHANGED_WINDOW));
        let joined = registry.join();
        let guard = SessionGuard::new(registry.clone(), joined.id);
        assert_eq!(registry.client_count(), 1);
        drop(guard);
        assert_eq!(registry.client_count(), 0);
    }
}
