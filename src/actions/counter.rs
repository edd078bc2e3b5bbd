//! Administration surface: every write an admin can make to the tally.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::history::HistoryLog;
use super::special::SpecialChannel;
use super::{Op, apply};
use crate::error::{AdminError, ValidationError};
use crate::state::{CounterState, HistoryEntry, HistoryKind, SpecialAnimation};
use crate::store::{COUNTER_KEY, HISTORY_KEY, Precondition, WriteOp};
use crate::sync::SyncBridge;

pub struct Admin {
    bridge: Arc<SyncBridge>,
    history: HistoryLog,
    special: SpecialChannel,
}

impl Admin {
    pub fn new(bridge: Arc<SyncBridge>, history: HistoryLog, special: SpecialChannel) -> Self {
        Self {
            bridge,
            history,
            special,
        }
    }

    pub fn current(&self) -> i64 {
        self.bridge.holder().value()
    }

    pub async fn set(&self, value: i64) -> Result<i64, AdminError> {
        let (prev, next, _) = self
            .write(Op::Set, value, Vec::new(), |prev, next| {
                HistoryEntry::new(HistoryKind::Set, next, Some(prev))
            })
            .await?;
        info!(prev, value = next, "Counter set");
        Ok(next)
    }

    pub async fn add(&self, amount: i64) -> Result<i64, AdminError> {
        if amount <= 0 {
            return Err(ValidationError::NonPositive.into());
        }
        let (prev, next, _) = self
            .write(Op::Add, amount, Vec::new(), |prev, next| {
                HistoryEntry::new(HistoryKind::Add, next, Some(prev)).with_amount(amount)
            })
            .await?;
        info!(prev, amount, value = next, "Donation added");
        Ok(next)
    }

    /// Add a special donation and put its announcement on every display.
    /// The amount, the history entry and the announcement commit together or
    /// not at all.
    pub async fn special(&self, amount: i64, message: Option<String>) -> Result<i64, AdminError> {
        if amount <= 0 {
            return Err(ValidationError::NonPositive.into());
        }
        let message = message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        let event = SpecialAnimation::announcing(message.clone(), Some(amount));
        let (prev, next, versions) = self
            .write(
                Op::Add,
                amount,
                SpecialChannel::announce_ops(&event),
                move |prev, next| {
                    HistoryEntry::new(HistoryKind::Special, next, Some(prev))
                        .with_amount(amount)
                        .with_message(message)
                },
            )
            .await?;
        self.special
            .show(event, versions.first().copied().unwrap_or_default());
        info!(prev, amount, value = next, "Special donation added");
        Ok(next)
    }

    /// Set the counter to zero and wipe the history. There is no undo: the
    /// log that would allow one is what gets deleted.
    pub async fn reset(&self) -> Result<(), AdminError> {
        self.bridge
            .store()
            .transaction(
                Vec::new(),
                vec![
                    WriteOp::Merge {
                        key: COUNTER_KEY.to_string(),
                        patch: CounterState::patch(apply(Op::Reset, 0, 0), Utc::now()),
                    },
                    HistoryLog::clear_op(),
                ],
            )
            .await?;
        self.bridge.holder().commit_local(0);
        info!("Counter reset, history cleared");
        Ok(())
    }

    /// Restore the value an entry replaced and drop the entry, as one store
    /// transaction. Fails with a conflict if the counter was written or the
    /// entry removed since they were read.
    pub async fn rollback(&self, entry_id: &str) -> Result<i64, AdminError> {
        let store = self.bridge.store();
        let counter = store.get(COUNTER_KEY).await?;
        let entry = self
            .history
            .find(entry_id)
            .await?
            .ok_or_else(|| AdminError::HistoryEntryNotFound(entry_id.to_string()))?;
        let target = entry
            .rollback_target()
            .ok_or_else(|| AdminError::NotRollbackEligible(entry_id.to_string()))?;

        store
            .transaction(
                vec![
                    Precondition::Version {
                        key: COUNTER_KEY.to_string(),
                        version: counter.version,
                    },
                    Precondition::FieldPresent {
                        key: HISTORY_KEY.to_string(),
                        field: entry.id.clone(),
                    },
                ],
                vec![
                    WriteOp::Merge {
                        key: COUNTER_KEY.to_string(),
                        patch: CounterState::patch(target, Utc::now()),
                    },
                    HistoryLog::remove_op(&entry.id),
                ],
            )
            .await?;
        self.bridge.holder().commit_local(target);
        info!(entry = %entry.id, from = entry.value, to = target, "Rolled back history entry");
        Ok(target)
    }

    /// Recent history, newest first, capped at the display window.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, AdminError> {
        Ok(self.history.recent().await?)
    }

    /// Apply `op` to the local value, publish it, and append the entry built
    /// by `entry` plus any `extra` ops in the same store transaction. Returns
    /// the previous and new value and the version each extra op committed at.
    async fn write<F>(
        &self,
        op: Op,
        n: i64,
        extra: Vec<WriteOp>,
        entry: F,
    ) -> Result<(i64, i64, Vec<u64>), AdminError>
    where
        F: FnOnce(i64, i64) -> HistoryEntry,
    {
        let holder = self.bridge.holder();
        let prev = holder.value();
        let next = apply(op, prev, n);
        let record = entry(prev, next);

        let published = match holder.set_value(next) {
            Some(update) => {
                let mut ops = vec![HistoryLog::append_op(&record)];
                ops.extend(extra.iter().cloned());
                self.bridge
                    .publish_with(update, ops)
                    .await?
                    .map(|mut versions| versions.split_off(versions.len().min(1)))
            }
            None => None,
        };
        let versions = match published {
            Some(versions) => versions,
            None => self.history.record_action(&record, extra).await?,
        };
        Ok((prev, next, versions))
    }
}
