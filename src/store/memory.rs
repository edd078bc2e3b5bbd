use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{
    Precondition, Snapshot, Store, Subscription, SubscriptionToken, WriteOp, merge_into,
};
use crate::error::StoreError;

/// In-process store. Every operation runs under one lock, so transactions are
/// atomic across keys and notifications leave in commit order.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    connected: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Doc>,
    subscribers: HashMap<SubscriptionToken, Subscriber>,
    next_token: u64,
}

#[derive(Default)]
struct Doc {
    value: Option<Value>,
    version: u64,
}

struct Subscriber {
    key: String,
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner::default()),
            connected,
        }
    }

    /// Seed the store. Seeded documents start at version 1.
    pub fn with_documents(docs: impl IntoIterator<Item = (String, Value)>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for (key, value) in docs {
                if value.is_null() {
                    continue;
                }
                inner.docs.insert(
                    key,
                    Doc {
                        value: Some(value),
                        version: 1,
                    },
                );
            }
        }
        store
    }

    /// Load a snapshot file written by [`MemoryStore::persist`]. A missing file
    /// yields an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            info!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let docs: Map<String, Value> = serde_json::from_str(&raw)?;
        info!(path = %path.display(), keys = docs.len(), "Loaded store snapshot");
        Ok(Self::with_documents(docs))
    }

    pub fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let docs: Map<String, Value> = {
            let inner = self.inner.lock();
            inner
                .docs
                .iter()
                .filter_map(|(k, d)| d.value.clone().map(|v| (k.clone(), v)))
                .collect()
        };
        let bytes = serde_json::to_vec_pretty(&Value::Object(docs))?;
        std::fs::write(path, bytes)?;
        debug!(path = %path.display(), "Persisted store snapshot");
        Ok(())
    }

    /// Simulate the transport going away or coming back. Going offline ends
    /// every open subscription; operations fail until the store is back.
    pub fn set_connected(&self, connected: bool) {
        if !connected {
            self.inner.lock().subscribers.clear();
        }
        self.connected.send_replace(connected);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if *self.connected.borrow() {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }
}

impl Inner {
    fn snapshot(&self, key: &str) -> Snapshot {
        let (value, version) = self
            .docs
            .get(key)
            .map(|d| (d.value.clone(), d.version))
            .unwrap_or((None, 0));
        Snapshot {
            key: key.to_string(),
            value,
            version,
        }
    }

    fn apply(&mut self, op: WriteOp) -> u64 {
        let key = op.key().to_string();
        let doc = self.docs.entry(key.clone()).or_default();
        match op {
            WriteOp::Set { value, .. } => {
                doc.value = if value.is_null() { None } else { Some(value) };
            }
            WriteOp::Merge { patch, .. } => merge_into(&mut doc.value, &patch),
            WriteOp::Delete { .. } => doc.value = None,
        }
        doc.version += 1;
        let version = doc.version;
        self.notify(&key);
        version
    }

    fn notify(&mut self, key: &str) {
        let snapshot = self.snapshot(key);
        self.subscribers
            .retain(|_, sub| sub.key != key || sub.tx.send(snapshot.clone()).is_ok());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError> {
        self.ensure_connected()?;
        Ok(self.inner.lock().snapshot(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        self.ensure_connected()?;
        Ok(self.inner.lock().apply(WriteOp::Set {
            key: key.to_string(),
            value,
        }))
    }

    async fn merge(&self, key: &str, patch: Map<String, Value>) -> Result<u64, StoreError> {
        self.ensure_connected()?;
        Ok(self.inner.lock().apply(WriteOp::Merge {
            key: key.to_string(),
            patch,
        }))
    }

    async fn transaction(
        &self,
        preconditions: Vec<Precondition>,
        ops: Vec<WriteOp>,
    ) -> Result<Vec<u64>, StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock();
        for p in &preconditions {
            p.check(&inner.snapshot(p.key()))?;
        }
        Ok(ops.into_iter().map(|op| inner.apply(op)).collect())
    }

    fn subscribe(&self, key: &str) -> Result<Subscription, StoreError> {
        self.ensure_connected()?;
        let (tx, updates) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_token += 1;
        let token = SubscriptionToken(inner.next_token);
        // Receiver is alive, send cannot fail here.
        let _ = tx.send(inner.snapshot(key));
        inner.subscribers.insert(
            token,
            Subscriber {
                key: key.to_string(),
                tx,
            },
        );
        Ok(Subscription { token, updates })
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.inner.lock().subscribers.remove(&token);
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{COUNTER_KEY, HISTORY_KEY};
    use serde_json::json;

    #[tokio::test]
    async fn subscription_sees_current_then_every_write() {
        let store = MemoryStore::new();
        store.set(COUNTER_KEY, json!({ "value": 1 })).await.unwrap();

        let mut sub = store.subscribe(COUNTER_KEY).unwrap();
        let first = sub.updates.recv().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.document()["value"], 1);

        store
            .merge(COUNTER_KEY, json!({ "value": 2 }).as_object().unwrap().clone())
            .await
            .unwrap();
        let second = sub.updates.recv().await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.document()["value"], 2);
    }

    #[tokio::test]
    async fn unsubscribe_closes_feed() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(COUNTER_KEY).unwrap();
        let _ = sub.updates.recv().await;
        store.unsubscribe(sub.token);
        assert!(sub.updates.recv().await.is_none());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn other_keys_do_not_notify() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(COUNTER_KEY).unwrap();
        let _ = sub.updates.recv().await;
        store.set(HISTORY_KEY, json!({ "a": 1 })).await.unwrap();
        assert!(sub.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_store_rejects_and_drops_subscribers() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(COUNTER_KEY).unwrap();
        let _ = sub.updates.recv().await;

        store.set_connected(false);
        assert!(sub.updates.recv().await.is_none());
        assert!(matches!(
            store.get(COUNTER_KEY).await,
            Err(StoreError::Disconnected)
        ));
        assert!(store.subscribe(COUNTER_KEY).is_err());

        store.set_connected(true);
        assert!(store.subscribe(COUNTER_KEY).is_ok());
    }

    #[tokio::test]
    async fn failed_transaction_applies_nothing() {
        let store = MemoryStore::new();
        store.set(COUNTER_KEY, json!({ "value": 1 })).await.unwrap();
        store.set(HISTORY_KEY, json!({ "a": {} })).await.unwrap();

        let result = store
            .transaction(
                vec![
                    Precondition::Version { key: COUNTER_KEY.into(), version: 1 },
                    Precondition::FieldPresent { key: HISTORY_KEY.into(), field: "missing".into() },
                ],
                vec![WriteOp::Delete { key: COUNTER_KEY.into() }],
            )
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        let snap = store.get(COUNTER_KEY).await.unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.document()["value"], 1);
    }

    #[tokio::test]
    async fn transaction_reports_each_committed_version() {
        let store = MemoryStore::new();
        store.set(COUNTER_KEY, json!({ "value": 1 })).await.unwrap();

        let versions = store
            .transaction(
                Vec::new(),
                vec![
                    WriteOp::Merge {
                        key: COUNTER_KEY.into(),
                        patch: json!({ "value": 2 }).as_object().unwrap().clone(),
                    },
                    WriteOp::Set { key: HISTORY_KEY.into(), value: json!({ "a": {} }) },
                ],
            )
            .await
            .unwrap();
        assert_eq!(versions, vec![2, 1]);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::new();
        store.set(COUNTER_KEY, json!({ "value": 77 })).await.unwrap();
        store.persist(&path).unwrap();

        let reloaded = MemoryStore::load(&path).unwrap();
        let snap = reloaded.get(COUNTER_KEY).await.unwrap();
        assert_eq!(snap.document()["value"], 77);
        assert_eq!(snap.version, 1);
    }

    #[test]
    fn missing_snapshot_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(store.subscriber_count(), 0);
    }
}
