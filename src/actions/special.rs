//! Special-donation announcements.
//!
//! Two states, idle and announcing. An announcement expires on its own after
//! a fixed display duration: the local timer clears the local state and writes
//! `{active: false}` back so clients joining later do not pick up a stale
//! announcement. Every client runs its own timer; whichever fires first
//! clears the flag and the others see the cleared document and stand down.
//! A timer only clears the announcement it was armed for: the clear is a
//! compare-and-set on that announcement's store version.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::state::SpecialAnimation;
use crate::store::{COUNTER_KEY, Precondition, SPECIAL_KEY, Snapshot, Store, WriteOp};

pub const DEFAULT_DISPLAY_DURATION: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SpecialChannel {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<dyn Store>,
    duration: Duration,
    state: watch::Sender<SpecialAnimation>,
    timer: Mutex<Timer>,
    // Highest `special_animation` version shown so far.
    seen: Mutex<u64>,
}

#[derive(Default)]
struct Timer {
    // Bumped on every arm/cancel; a timer only fires if its epoch is current.
    epoch: u64,
    armed: Option<Armed>,
}

struct Armed {
    expires_at: Instant,
    handle: JoinHandle<()>,
}

impl SpecialChannel {
    pub fn new(store: Arc<dyn Store>, duration: Duration) -> Self {
        let (state, _) = watch::channel(SpecialAnimation::idle());
        Self {
            shared: Arc::new(Shared {
                store,
                duration,
                state,
                timer: Mutex::new(Timer::default()),
                seen: Mutex::new(0),
            }),
        }
    }

    pub fn state(&self) -> SpecialAnimation {
        self.shared.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SpecialAnimation> {
        self.shared.state.subscribe()
    }

    /// Time left on the current announcement, if one is showing.
    pub fn remaining(&self) -> Option<Duration> {
        self.shared
            .timer
            .lock()
            .armed
            .as_ref()
            .map(|armed| armed.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Start an announcement. A fresh announcement replaces whatever was
    /// showing and restarts the display timer.
    pub async fn announce(
        &self,
        message: Option<String>,
        amount: Option<i64>,
    ) -> Result<(), StoreError> {
        let event = SpecialAnimation::announcing(message, amount);
        let versions = self
            .shared
            .store
            .transaction(Vec::new(), Self::announce_ops(&event))
            .await?;
        self.show(event, versions.first().copied().unwrap_or_default());
        Ok(())
    }

    /// Writes that publish `event`: the `special_animation` document first,
    /// then the mirror fields on the counter record. Callers committing these
    /// as part of a larger transaction hand the first op's version to
    /// [`SpecialChannel::show`].
    pub fn announce_ops(event: &SpecialAnimation) -> Vec<WriteOp> {
        vec![
            WriteOp::Set {
                key: SPECIAL_KEY.to_string(),
                value: event.to_document(),
            },
            WriteOp::Merge {
                key: COUNTER_KEY.to_string(),
                patch: event.counter_mirror(),
            },
        ]
    }

    /// Show an announcement this client committed at `version`.
    pub fn show(&self, event: SpecialAnimation, version: u64) {
        info!(message = ?event.message, amount = ?event.amount, version, "Special announcement started");
        if self.observe(version) {
            self.enter(event, version);
        }
    }

    /// Apply a `special_animation` snapshot pushed by the store. Snapshots
    /// at or below a version already shown are ignored.
    pub fn apply_remote(&self, snapshot: &Snapshot) {
        if !self.observe(snapshot.version) {
            return;
        }
        let incoming = SpecialAnimation::from_document(snapshot.document());
        if incoming.active {
            debug!(message = ?incoming.message, version = snapshot.version, "Special announcement received");
            self.enter(incoming, snapshot.version);
            return;
        }
        self.cancel_timer();
        let cleared = self.shared.state.send_if_modified(|state| {
            let was_active = state.active;
            *state = SpecialAnimation::idle();
            was_active
        });
        if cleared {
            info!(version = snapshot.version, "Special announcement cleared remotely");
        }
    }

    /// Stop the display timer without touching the store. Called on teardown.
    pub fn shutdown(&self) {
        self.cancel_timer();
    }

    fn observe(&self, version: u64) -> bool {
        let mut seen = self.shared.seen.lock();
        if version <= *seen {
            return false;
        }
        *seen = version;
        true
    }

    fn enter(&self, event: SpecialAnimation, version: u64) {
        self.shared.state.send_replace(event);
        self.arm(version);
    }

    /// Start the display timer for the announcement stored at `version`.
    fn arm(&self, version: u64) {
        let mut timer = self.shared.timer.lock();
        timer.epoch += 1;
        let epoch = timer.epoch;

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(shared.duration).await;
            expire(&shared, epoch, version).await;
        });
        let armed = Armed {
            expires_at: Instant::now() + self.shared.duration,
            handle,
        };
        if let Some(previous) = timer.armed.replace(armed) {
            previous.handle.abort();
        }
    }

    fn cancel_timer(&self) {
        let mut timer = self.shared.timer.lock();
        timer.epoch += 1;
        if let Some(armed) = timer.armed.take() {
            armed.handle.abort();
        }
    }
}

async fn expire(shared: &Shared, epoch: u64, version: u64) {
    {
        let mut timer = shared.timer.lock();
        if timer.epoch != epoch {
            return;
        }
        // Our own handle; dropping it detaches, the task finishes normally.
        timer.armed = None;
        shared.state.send_replace(SpecialAnimation::idle());
    }

    match clear_remote(shared, version).await {
        Ok(true) => info!(version, "Special announcement expired"),
        Ok(false) => debug!(version, "Special announcement already cleared or replaced"),
        Err(e) => warn!(error = %e, "Failed to clear special announcement"),
    }
}

/// Clear the stored flag only if it is still the announcement written at
/// `version`. A clear or a newer announcement since then wins.
async fn clear_remote(shared: &Shared, version: u64) -> Result<bool, StoreError> {
    let idle = SpecialAnimation::idle();
    let result = shared
        .store
        .transaction(
            vec![Precondition::Version {
                key: SPECIAL_KEY.to_string(),
                version,
            }],
            vec![
                WriteOp::Set {
                    key: SPECIAL_KEY.to_string(),
                    value: idle.to_document(),
                },
                WriteOp::Merge {
                    key: COUNTER_KEY.to_string(),
                    patch: idle.counter_mirror(),
                },
            ],
        )
        .await;
    match result {
        Ok(_) => Ok(true),
        Err(StoreError::Conflict { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::{Value, json};

    fn channel() -> (Arc<MemoryStore>, SpecialChannel) {
        let store = Arc::new(MemoryStore::with_documents([(
            COUNTER_KEY.to_string(),
            json!({ "value": 1000 }),
        )]));
        let dyn_store: Arc<dyn Store> = store.clone();
        (store, SpecialChannel::new(dyn_store, DEFAULT_DISPLAY_DURATION))
    }

    fn snapshot(version: u64, doc: Value) -> Snapshot {
        Snapshot {
            key: SPECIAL_KEY.to_string(),
            value: Some(doc),
            version,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn announcement_expires_after_display_duration() {
        let (store, special) = channel();
        special.announce(Some("Tak!".into()), Some(5000)).await.unwrap();

        assert_eq!(
            special.state(),
            SpecialAnimation::announcing(Some("Tak!".into()), Some(5000))
        );
        let doc = store.get(SPECIAL_KEY).await.unwrap();
        assert_eq!(doc.document()["active"], true);
        let counter = store.get(COUNTER_KEY).await.unwrap();
        assert_eq!(counter.document()["specialAnimation"], true);
        assert_eq!(counter.document()["amount"], 5000);

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(special.state(), SpecialAnimation::idle());
        assert!(special.remaining().is_none());
        let doc = store.get(SPECIAL_KEY).await.unwrap();
        assert_eq!(doc.document()["active"], false);
        let counter = store.get(COUNTER_KEY).await.unwrap();
        assert_eq!(counter.document(), &json!({ "value": 1000 }));

        // Nothing fires afterwards.
        let version = doc.version;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.get(SPECIAL_KEY).await.unwrap().version, version);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_announcement_restarts_timer() {
        let (_store, special) = channel();
        special.announce(Some("first".into()), Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        special.announce(Some("second".into()), Some(2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let state = special.state();
        assert!(state.active);
        assert_eq!(state.message.as_deref(), Some("second"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!special.state().active);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_leaves_newer_announcement_in_place() {
        let (store, first) = channel();
        let dyn_store: Arc<dyn Store> = store.clone();
        // A second client on the same store that has not seen the first
        // client's announcement yet.
        let second = SpecialChannel::new(dyn_store, DEFAULT_DISPLAY_DURATION);

        first.announce(Some("A".into()), Some(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(9_900)).await;
        second.announce(Some("B".into()), Some(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The first client's timer fired against an announcement it no
        // longer owns.
        assert!(!first.state().active);
        let doc = store.get(SPECIAL_KEY).await.unwrap();
        assert_eq!(
            doc.document(),
            &json!({ "active": true, "message": "B", "amount": 200 })
        );
        let counter = store.get(COUNTER_KEY).await.unwrap();
        assert_eq!(counter.document()["specialAnimation"], true);
        assert_eq!(counter.document()["amount"], 200);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            store.get(SPECIAL_KEY).await.unwrap().document(),
            &json!({ "active": false })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_after_back_to_back_announcements_stops_latest_timer() {
        let (store, special) = channel();
        special.announce(Some("first".into()), Some(1)).await.unwrap();
        // Lands on the instant the first timer is due.
        tokio::time::sleep(DEFAULT_DISPLAY_DURATION).await;
        special.announce(Some("second".into()), Some(2)).await.unwrap();
        let version = store.get(SPECIAL_KEY).await.unwrap().version;

        special.shutdown();
        assert!(special.remaining().is_none());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.get(SPECIAL_KEY).await.unwrap().version, version);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_clear_cancels_local_timer() {
        let (store, special) = channel();
        special.announce(Some("Tak!".into()), Some(5)).await.unwrap();

        // Another client's timer fired first.
        let cleared = store
            .set(SPECIAL_KEY, json!({ "active": false }))
            .await
            .unwrap();
        special.apply_remote(&snapshot(cleared, json!({ "active": false })));
        assert!(!special.state().active);
        assert!(special.remaining().is_none());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.get(SPECIAL_KEY).await.unwrap().version, cleared);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_announcement_arms_local_timer() {
        let (store, special) = channel();
        let doc = json!({ "active": true, "message": "hej", "amount": 300 });
        let version = store.set(SPECIAL_KEY, doc.clone()).await.unwrap();
        special.apply_remote(&snapshot(version, doc));
        assert!(special.state().active);
        assert_eq!(special.remaining(), Some(DEFAULT_DISPLAY_DURATION));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!special.state().active);
        assert_eq!(
            store.get(SPECIAL_KEY).await.unwrap().document()["active"],
            false
        );
    }

    #[tokio::test(start_paused = true)]
    async fn identical_remote_announcement_restarts_timer() {
        let (store, special) = channel();
        let doc = json!({ "active": true, "message": "hej", "amount": 300 });
        let first = store.set(SPECIAL_KEY, doc.clone()).await.unwrap();
        special.apply_remote(&snapshot(first, doc.clone()));

        tokio::time::sleep(Duration::from_secs(6)).await;
        // Same donation announced again by another admin.
        let second = store.set(SPECIAL_KEY, doc.clone()).await.unwrap();
        special.apply_remote(&snapshot(second, doc));
        assert_eq!(special.remaining(), Some(DEFAULT_DISPLAY_DURATION));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(special.state().active);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!special.state().active);
        assert_eq!(
            store.get(SPECIAL_KEY).await.unwrap().document()["active"],
            false
        );
    }

    #[tokio::test(start_paused = true)]
    async fn older_snapshot_is_ignored() {
        let (_store, special) = channel();
        special.apply_remote(&snapshot(
            3,
            json!({ "active": true, "message": "new", "amount": 2 }),
        ));
        special.apply_remote(&snapshot(
            2,
            json!({ "active": true, "message": "old", "amount": 1 }),
        ));
        assert_eq!(special.state().message.as_deref(), Some("new"));

        special.apply_remote(&snapshot(2, json!({ "active": false })));
        assert!(special.state().active);
        special.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_pending_expiry() {
        let (store, special) = channel();
        special.announce(None, Some(5)).await.unwrap();
        let version = store.get(SPECIAL_KEY).await.unwrap().version;
        special.shutdown();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.get(SPECIAL_KEY).await.unwrap().version, version);
    }
}
