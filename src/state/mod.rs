pub mod record;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{COUNTER_KEY, Store};

pub use record::{CounterState, HistoryEntry, HistoryKind, SpecialAnimation};

/// Where a change to the counter came from. Only `Local` changes are ever
/// written back to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterUpdate {
    pub value: i64,
    pub origin: Origin,
}

/// Process-local copy of the counter.
///
/// Remote notifications come in through [`CounterHolder::update_local`];
/// UI/admin edits go through [`CounterHolder::set_value`], which hands back the
/// update to publish. Because every update carries its origin, a value that
/// just arrived from the store can never be mistaken for a local edit and
/// written straight back.
///
/// Writes are asynchronous, so a store value can land while a publish is in
/// flight. Every change to the synced marker from outside a publish bumps a
/// sequence number; a publish captures it up front with
/// [`CounterHolder::sync_seq`] and only records its own value as synced if
/// nothing else touched the marker in the meantime.
#[derive(Clone)]
pub struct CounterHolder {
    inner: Arc<Mutex<Inner>>,
    changes: watch::Sender<CounterUpdate>,
}

struct Inner {
    value: i64,
    // Last value sent to or received from the store.
    synced: Option<i64>,
    sync_seq: u64,
}

impl CounterHolder {
    pub fn new(initial: i64) -> Self {
        let (changes, _) = watch::channel(CounterUpdate {
            value: initial,
            origin: Origin::Remote,
        });
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: initial,
                synced: None,
                sync_seq: 0,
            })),
            changes,
        }
    }

    pub fn value(&self) -> i64 {
        self.inner.lock().value
    }

    /// The most recent update, local or remote.
    pub fn latest(&self) -> CounterUpdate {
        *self.changes.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<CounterUpdate> {
        self.changes.subscribe()
    }

    /// Apply a value pushed by the store. Never produces a write.
    /// Returns whether the displayed value changed.
    pub fn update_local(&self, value: i64) -> bool {
        let mut inner = self.inner.lock();
        inner.synced = Some(value);
        inner.sync_seq += 1;
        if inner.value == value {
            return false;
        }
        inner.value = value;
        self.changes.send_replace(CounterUpdate {
            value,
            origin: Origin::Remote,
        });
        true
    }

    /// Apply a local edit. Returns the update to publish, or `None` when the
    /// store already holds this value.
    pub fn set_value(&self, value: i64) -> Option<CounterUpdate> {
        let mut inner = self.inner.lock();
        let update = CounterUpdate {
            value,
            origin: Origin::Local,
        };
        if inner.value != value {
            inner.value = value;
            self.changes.send_replace(update);
        }
        if inner.synced == Some(value) {
            None
        } else {
            Some(update)
        }
    }

    /// Record a local value that is already committed to the store (rollback,
    /// reset), so no further write is produced for it.
    pub fn commit_local(&self, value: i64) {
        let mut inner = self.inner.lock();
        inner.synced = Some(value);
        inner.sync_seq += 1;
        if inner.value != value {
            inner.value = value;
            self.changes.send_replace(CounterUpdate {
                value,
                origin: Origin::Local,
            });
        }
    }

    pub fn is_synced(&self, value: i64) -> bool {
        self.inner.lock().synced == Some(value)
    }

    pub fn mark_synced(&self, value: i64) {
        let mut inner = self.inner.lock();
        inner.synced = Some(value);
        inner.sync_seq += 1;
    }

    pub fn sync_seq(&self) -> u64 {
        self.inner.lock().sync_seq
    }

    /// Record `value` as what the store holds after a write that started at
    /// `seq`. Refused if a store value arrived since; returns whether the
    /// marker was updated.
    pub fn mark_synced_since(&self, value: i64, seq: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.sync_seq != seq {
            return false;
        }
        inner.synced = Some(value);
        true
    }

    /// Forget what the store holds after a failed write that started at
    /// `seq`, unless a store value arrived since.
    pub fn mark_unsynced_since(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if inner.sync_seq == seq {
            inner.synced = None;
        }
    }
}

/// Load the counter from the store, seeding it with `initial` if the store
/// has no usable value yet. Returns the current value.
pub async fn init_or_load_counter(store: &dyn Store, initial: i64) -> Result<i64, StoreError> {
    let snapshot = store.get(COUNTER_KEY).await?;
    if let Some(state) = CounterState::from_document(snapshot.document()) {
        debug!(value = state.value, version = snapshot.version, "Loaded counter");
        return Ok(state.value);
    }
    store
        .merge(COUNTER_KEY, CounterState::patch(initial, Utc::now()))
        .await?;
    info!(value = initial, "Seeded empty store with initial counter");
    Ok(initial)
}
