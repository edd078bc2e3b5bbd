//! Glue between the local [`CounterHolder`] and the shared [`Store`].
//!
//! Inbound: every snapshot of `counter` is applied to the holder as a remote
//! update, every snapshot of `special_animation` goes to the special-event
//! channel. Outbound: only local-origin updates are written, merged into the
//! stored record so unrelated fields survive.
//!
//! The subscription is retried forever with a fixed backoff. There is no
//! circuit breaker; a client that stays up will keep trying until it is torn
//! down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::special::SpecialChannel;
use crate::error::StoreError;
use crate::state::{CounterHolder, CounterState, CounterUpdate, Origin};
use crate::store::{
    COUNTER_KEY, ConflictPolicy, Precondition, SPECIAL_KEY, Snapshot, Store, WriteOp,
};

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub reconnect_backoff: Duration,
    pub policy: ConflictPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            policy: ConflictPolicy::LastWriteWins,
        }
    }
}

pub struct SyncBridge {
    store: Arc<dyn Store>,
    holder: CounterHolder,
    special: Option<SpecialChannel>,
    config: BridgeConfig,
    connected: watch::Sender<bool>,
    // Highest counter version seen, pinned by `RejectStale` writes.
    observed_version: Mutex<Option<u64>>,
}

impl SyncBridge {
    pub fn new(store: Arc<dyn Store>, holder: CounterHolder, config: BridgeConfig) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            store,
            holder,
            special: None,
            config,
            connected,
            observed_version: Mutex::new(None),
        }
    }

    /// Route `special_animation` snapshots to this channel.
    pub fn with_special(mut self, special: SpecialChannel) -> Self {
        self.special = Some(special);
        self
    }

    pub fn holder(&self) -> &CounterHolder {
        &self.holder
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Write a counter update to the store. Remote-origin updates and values
    /// the store already holds are skipped. Returns whether a write happened.
    pub async fn publish(&self, update: CounterUpdate) -> Result<bool, StoreError> {
        Ok(self.publish_with(update, Vec::new()).await?.is_some())
    }

    /// Like [`SyncBridge::publish`], committing `extra` ops in the same
    /// transaction (e.g. the history entry describing the change). Returns
    /// the version each extra op committed at, or `None` when the counter
    /// write was skipped; the extra ops are dropped together with it.
    pub async fn publish_with(
        &self,
        update: CounterUpdate,
        extra: Vec<WriteOp>,
    ) -> Result<Option<Vec<u64>>, StoreError> {
        if update.origin != Origin::Local || self.holder.is_synced(update.value) {
            return Ok(None);
        }

        let seq = self.holder.sync_seq();
        let touches_counter: Vec<bool> = extra.iter().map(|op| op.key() == COUNTER_KEY).collect();
        match self.write_counter(update.value, extra).await {
            Ok(mut versions) => {
                let extra_versions = versions.split_off(versions.len().min(1));
                let counter_version = versions
                    .into_iter()
                    .chain(
                        extra_versions
                            .iter()
                            .zip(&touches_counter)
                            .filter(|(_, counter)| **counter)
                            .map(|(version, _)| *version),
                    )
                    .max();
                if let Some(version) = counter_version {
                    self.observe_version(version);
                }
                if !self.holder.mark_synced_since(update.value, seq) {
                    debug!(value = update.value, "Store moved on during publish");
                }
                debug!(value = update.value, "Published counter");
                Ok(Some(extra_versions))
            }
            Err(e) => {
                self.holder.mark_unsynced_since(seq);
                warn!(value = update.value, error = %e, "Failed to publish counter");
                Err(e)
            }
        }
    }

    /// Commit the counter merge followed by `extra`; returns one version per
    /// op, counter first.
    async fn write_counter(&self, value: i64, extra: Vec<WriteOp>) -> Result<Vec<u64>, StoreError> {
        let patch = CounterState::patch(value, Utc::now());
        let preconditions = match self.config.policy {
            ConflictPolicy::LastWriteWins if extra.is_empty() => {
                return Ok(vec![self.store.merge(COUNTER_KEY, patch).await?]);
            }
            ConflictPolicy::LastWriteWins => Vec::new(),
            ConflictPolicy::RejectStale => {
                let observed = *self.observed_version.lock();
                let version = match observed {
                    Some(v) => v,
                    None => self.store.get(COUNTER_KEY).await?.version,
                };
                vec![Precondition::Version {
                    key: COUNTER_KEY.to_string(),
                    version,
                }]
            }
        };
        let mut ops = vec![WriteOp::Merge {
            key: COUNTER_KEY.to_string(),
            patch,
        }];
        ops.extend(extra);
        self.store.transaction(preconditions, ops).await
    }

    /// Publish whatever the holder currently shows, if it is an unsent local
    /// edit. A value that arrived from the store is never echoed back.
    pub async fn publish_latest(&self) -> Result<bool, StoreError> {
        self.publish(self.holder.latest()).await
    }

    /// Run the subscribe side until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut attempt: u64 = 0;
        loop {
            match self.pump(&cancel).await {
                Ok(()) => break,
                Err(e) => {
                    self.set_connected(false);
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        backoff_ms = self.config.reconnect_backoff.as_millis() as u64,
                        "Store subscription lost, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                    }
                }
            }
        }
        self.set_connected(false);
        debug!("Sync bridge stopped");
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move { bridge.run(cancel).await })
    }

    /// One connected session: subscribe, apply snapshots until the feed ends
    /// or we are cancelled, then release both subscriptions.
    async fn pump(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let mut counter = self.store.subscribe(COUNTER_KEY)?;
        let mut special = match self.store.subscribe(SPECIAL_KEY) {
            Ok(sub) => sub,
            Err(e) => {
                self.store.unsubscribe(counter.token);
                return Err(e);
            }
        };
        self.set_connected(true);
        info!("Subscribed to store");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                snapshot = counter.updates.recv() => match snapshot {
                    Some(s) => self.apply_counter(&s),
                    None => break Err(StoreError::Disconnected),
                },
                snapshot = special.updates.recv() => match snapshot {
                    Some(s) => self.apply_special(&s),
                    None => break Err(StoreError::Disconnected),
                },
            }
        };

        self.store.unsubscribe(counter.token);
        self.store.unsubscribe(special.token);
        result
    }

    fn apply_counter(&self, snapshot: &Snapshot) {
        self.observe_version(snapshot.version);
        match CounterState::from_document(snapshot.document()) {
            Some(state) => {
                if self.holder.update_local(state.value) {
                    debug!(value = state.value, version = snapshot.version, "Received counter update");
                }
            }
            None => debug!(version = snapshot.version, "Ignoring counter snapshot without a numeric value"),
        }
    }

    fn apply_special(&self, snapshot: &Snapshot) {
        if let Some(special) = &self.special {
            special.apply_remote(snapshot);
        }
    }

    fn observe_version(&self, version: u64) {
        let mut observed = self.observed_version.lock();
        if observed.is_none_or(|v| version > v) {
            *observed = Some(version);
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|c| {
            let changed = *c != connected;
            *c = connected;
            changed
        });
    }
}
