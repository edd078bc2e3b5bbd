//! The `counter_history` log.
//!
//! Entries are appended on every admin write and kept until they are rolled
//! back individually or the whole log is wiped by a reset. Only the most
//! recent `window` entries are ever shown; nothing is trimmed from the store.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::record::history_from_document;
use crate::state::{HistoryEntry, HistoryKind};
use crate::store::{HISTORY_KEY, Store, WriteOp};

pub const DEFAULT_HISTORY_WINDOW: usize = 20;

impl HistoryEntry {
    pub fn new(kind: HistoryKind, value: i64, previous_value: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            value,
            previous_value,
            updated_at: Utc::now(),
            kind,
            added_amount: None,
            message: None,
        }
    }

    pub fn with_amount(mut self, amount: i64) -> Self {
        self.added_amount = Some(amount);
        self
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }
}

pub struct HistoryLog {
    store: Arc<dyn Store>,
    window: usize,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn Store>, window: usize) -> Self {
        Self { store, window }
    }

    /// Op appending `entry`, for use inside a transaction.
    pub fn append_op(entry: &HistoryEntry) -> WriteOp {
        let mut patch = Map::new();
        patch.insert(
            entry.id.clone(),
            serde_json::to_value(entry).unwrap_or(Value::Null),
        );
        WriteOp::Merge {
            key: HISTORY_KEY.to_string(),
            patch,
        }
    }

    /// Op deleting a single entry.
    pub fn remove_op(id: &str) -> WriteOp {
        let mut patch = Map::new();
        patch.insert(id.to_string(), Value::Null);
        WriteOp::Merge {
            key: HISTORY_KEY.to_string(),
            patch,
        }
    }

    /// Op deleting the whole log.
    pub fn clear_op() -> WriteOp {
        WriteOp::Delete {
            key: HISTORY_KEY.to_string(),
        }
    }

    /// Append `entry` on its own, committing `extra` ops in the same
    /// transaction. Used when the counter itself needs no write. Returns the
    /// version each extra op committed at.
    pub async fn record_action(
        &self,
        entry: &HistoryEntry,
        extra: Vec<WriteOp>,
    ) -> Result<Vec<u64>, StoreError> {
        let mut ops = vec![Self::append_op(entry)];
        ops.extend(extra);
        let mut versions = self.store.transaction(Vec::new(), ops).await?;
        Ok(versions.split_off(versions.len().min(1)))
    }

    /// Every stored entry, most recent first.
    pub async fn all(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        let snapshot = self.store.get(HISTORY_KEY).await?;
        let mut entries = history_from_document(snapshot.document());
        entries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(entries)
    }

    /// The most recent entries, capped at the display window.
    pub async fn recent(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut entries = self.all().await?;
        entries.truncate(self.window);
        Ok(entries)
    }

    pub async fn find(&self, id: &str) -> Result<Option<HistoryEntry>, StoreError> {
        let snapshot = self.store.get(HISTORY_KEY).await?;
        Ok(history_from_document(snapshot.document())
            .into_iter()
            .find(|e| e.id == id))
    }
}
