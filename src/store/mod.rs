//! The synchronized key-value store every client reads from and writes to.
//!
//! Documents are JSON values under a handful of fixed keys. Each committed
//! write bumps the key's version, and every subscriber to that key receives
//! the new snapshot in commit order. That per-key order is the only ordering
//! the store promises; two clients racing on one key are resolved by whichever
//! write commits last.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::error::StoreError;

pub use memory::MemoryStore;

pub const COUNTER_KEY: &str = "counter";
pub const HISTORY_KEY: &str = "counter_history";
pub const SPECIAL_KEY: &str = "special_animation";

/// Handle returned by [`Store::subscribe`]; pass it back to
/// [`Store::unsubscribe`] on teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub(crate) u64);

/// A document as of a given version. `value` is `None` when the key is absent.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub key: String,
    pub value: Option<Value>,
    pub version: u64,
}

impl Snapshot {
    pub fn document(&self) -> &Value {
        self.value.as_ref().unwrap_or(&Value::Null)
    }
}

/// An open change feed. The current snapshot arrives first, then one snapshot
/// per committed write. The channel closes when the subscription is released
/// or the store drops the connection.
#[derive(Debug)]
pub struct Subscription {
    pub token: SubscriptionToken,
    pub updates: mpsc::UnboundedReceiver<Snapshot>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Replace the document. `Value::Null` removes it.
    Set { key: String, value: Value },
    /// Shallow merge; a `null` field deletes that field.
    Merge { key: String, patch: Map<String, Value> },
    Delete { key: String },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Set { key, .. } | WriteOp::Merge { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    /// Compare-and-set: the key must still be at this version.
    Version { key: String, version: u64 },
    /// The document must be an object containing `field`.
    FieldPresent { key: String, field: String },
}

impl Precondition {
    pub fn key(&self) -> &str {
        match self {
            Precondition::Version { key, .. } | Precondition::FieldPresent { key, .. } => key,
        }
    }

    /// Evaluate against a snapshot of [`Precondition::key`].
    pub fn check(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        match self {
            Precondition::Version { key, version } if snapshot.version != *version => {
                Err(StoreError::Conflict {
                    key: key.clone(),
                    reason: format!(
                        "expected version {version}, found {}",
                        snapshot.version
                    ),
                })
            }
            Precondition::FieldPresent { key, field }
                if snapshot.document().get(field.as_str()).is_none() =>
            {
                Err(StoreError::Conflict {
                    key: key.clone(),
                    reason: format!("`{field}` is gone"),
                })
            }
            _ => Ok(()),
        }
    }
}

/// How concurrent writers to the counter are reconciled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Blind merge; whichever write the store commits last is the value.
    #[default]
    LastWriteWins,
    /// Writers pin the version they read and fail with a conflict if another
    /// write committed in between.
    RejectStale,
}

/// Apply a merge patch to a document in place.
pub fn merge_into(doc: &mut Option<Value>, patch: &Map<String, Value>) {
    let target = doc.get_or_insert_with(|| Value::Object(Map::new()));
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (field, value) in patch {
            if value.is_null() {
                map.remove(field);
            } else {
                map.insert(field.clone(), value.clone());
            }
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError>;

    /// Replace a document; returns the new version.
    async fn set(&self, key: &str, value: Value) -> Result<u64, StoreError>;

    /// Partial write preserving unrelated fields; returns the new version.
    async fn merge(&self, key: &str, patch: Map<String, Value>) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        self.set(key, Value::Null).await
    }

    /// Check every precondition, then apply every op. Returns the version
    /// each op produced, in op order.
    ///
    /// This default is NOT atomic: preconditions are read one by one and the
    /// ops are applied in order, so a failure part-way through leaves the
    /// earlier ops committed. Stores with real multi-key transactions override
    /// it.
    async fn transaction(
        &self,
        preconditions: Vec<Precondition>,
        ops: Vec<WriteOp>,
    ) -> Result<Vec<u64>, StoreError> {
        for p in &preconditions {
            let snapshot = self.get(p.key()).await?;
            p.check(&snapshot)?;
        }
        let mut versions = Vec::with_capacity(ops.len());
        for op in ops {
            let version = match op {
                WriteOp::Set { key, value } => self.set(&key, value).await?,
                WriteOp::Merge { key, patch } => self.merge(&key, patch).await?,
                WriteOp::Delete { key } => self.delete(&key).await?,
            };
            versions.push(version);
        }
        Ok(versions)
    }

    fn subscribe(&self, key: &str) -> Result<Subscription, StoreError>;

    /// Release a subscription. Unknown tokens are ignored.
    fn unsubscribe(&self, token: SubscriptionToken);

    /// Connection status of the underlying transport.
    fn connection(&self) -> watch::Receiver<bool>;
}
