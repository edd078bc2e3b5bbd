//! Documents kept in the synchronized store.
//!
//! The store holds plain JSON; these types are the typed views the rest of the
//! crate works with. Parsing is lenient: a document written by an older client
//! (missing `updatedAt`, extra fields, a float that is really an integer) still
//! yields a value, while anything that is not a number is ignored.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const VALUE_FIELD: &str = "value";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
pub const SPECIAL_FLAG_FIELD: &str = "specialAnimation";
pub const MESSAGE_FIELD: &str = "message";
pub const AMOUNT_FIELD: &str = "amount";
pub const ACTIVE_FIELD: &str = "active";

/// Interpret a JSON value as a tally count.
///
/// Integers are taken as-is. Floats are accepted only when they carry no
/// fractional part (`150.0`), since JavaScript clients do not distinguish the
/// two. Strings, booleans, `NaN` and friends are rejected.
pub fn count_from_value(v: &Value) -> Option<i64> {
    let Value::Number(n) = v else {
        return None;
    };
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    n.as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0)
        .filter(|f| *f >= i64::MIN as f64 && *f < i64::MAX as f64)
        .map(|f| f as i64)
}

/// ISO-8601 timestamp with millisecond precision, the format browsers emit.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The `counter` document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterState {
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CounterState {
    /// Read the counter out of a raw document. `None` when the document is
    /// missing or its `value` field is not a number.
    pub fn from_document(doc: &Value) -> Option<Self> {
        let value = count_from_value(doc.get(VALUE_FIELD)?)?;
        let updated_at = doc
            .get(UPDATED_AT_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        Some(Self { value, updated_at })
    }

    /// Partial write that replaces `value` and `updatedAt` and leaves every
    /// other field of the stored record alone.
    pub fn patch(value: i64, at: DateTime<Utc>) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert(VALUE_FIELD.to_string(), Value::from(value));
        patch.insert(UPDATED_AT_FIELD.to_string(), Value::from(timestamp(at)));
        patch
    }
}

/// What kind of admin write produced a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Set,
    Add,
    Special,
    Reset,
}

/// One entry of the `counter_history` log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(default)]
    pub id: String,
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<i64>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HistoryEntry {
    /// The value a rollback of this entry restores. Reset entries and legacy
    /// entries without a recorded previous value have none.
    pub fn rollback_target(&self) -> Option<i64> {
        match self.kind {
            HistoryKind::Reset => None,
            _ => self.previous_value,
        }
    }

    pub fn is_rollback_eligible(&self) -> bool {
        self.rollback_target().is_some()
    }
}

/// Parse the whole `counter_history` document (`{ entryId: entry }`).
/// Entries that fail to parse are skipped.
pub fn history_from_document(doc: &Value) -> Vec<HistoryEntry> {
    let Some(map) = doc.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(id, raw)| {
            let mut entry: HistoryEntry = serde_json::from_value(raw.clone()).ok()?;
            entry.id = id.clone();
            Some(entry)
        })
        .collect()
}

/// The `special_animation` document, also the in-process state of the
/// special-event channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialAnimation {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
}

impl SpecialAnimation {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn announcing(message: Option<String>, amount: Option<i64>) -> Self {
        Self {
            active: true,
            message,
            amount,
        }
    }

    /// Missing or malformed documents read as idle.
    pub fn from_document(doc: &Value) -> Self {
        let active = doc
            .get(ACTIVE_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !active {
            return Self::idle();
        }
        Self {
            active,
            message: doc
                .get(MESSAGE_FIELD)
                .and_then(Value::as_str)
                .map(str::to_string),
            amount: doc.get(AMOUNT_FIELD).and_then(count_from_value),
        }
    }

    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Merge patch mirroring this event onto the `counter` record. An idle
    /// event produces `null`s, which delete the mirrored fields.
    pub fn counter_mirror(&self) -> Map<String, Value> {
        let mut patch = Map::new();
        if self.active {
            patch.insert(SPECIAL_FLAG_FIELD.to_string(), Value::Bool(true));
            patch.insert(
                MESSAGE_FIELD.to_string(),
                self.message.clone().map(Value::from).unwrap_or(Value::Null),
            );
            patch.insert(
                AMOUNT_FIELD.to_string(),
                self.amount.map(Value::from).unwrap_or(Value::Null),
            );
        } else {
            patch.insert(SPECIAL_FLAG_FIELD.to_string(), Value::Null);
            patch.insert(MESSAGE_FIELD.to_string(), Value::Null);
            patch.insert(AMOUNT_FIELD.to_string(), Value::Null);
        }
        patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn count_accepts_integral_numbers_only() {
        assert_eq!(count_from_value(&json!(150)), Some(150));
        assert_eq!(count_from_value(&json!(150.0)), Some(150));
        assert_eq!(count_from_value(&json!(-3)), Some(-3));
        assert_eq!(count_from_value(&json!(1.5)), None);
        assert_eq!(count_from_value(&json!("abc")), None);
        assert_eq!(count_from_value(&json!("150")), None);
        assert_eq!(count_from_value(&json!(null)), None);
    }

    #[test]
    fn counter_state_ignores_non_numeric_value() {
        assert!(CounterState::from_document(&json!({ "value": "x" })).is_none());
        assert!(CounterState::from_document(&json!({})).is_none());

        let s = CounterState::from_document(&json!({
            "value": 42,
            "updatedAt": "2024-03-01T10:00:00.000Z",
            "specialAnimation": true
        }))
        .unwrap();
        assert_eq!(s.value, 42);
        assert!(s.updated_at.is_some());
    }

    #[test]
    fn history_document_uses_keys_as_ids() {
        let doc = json!({
            "a": { "value": 150, "previousValue": 100, "updatedAt": "2024-03-01T10:00:00Z", "type": "add", "addedAmount": 50 },
            "b": { "value": 0, "updatedAt": "2024-03-01T11:00:00Z", "type": "reset" },
            "broken": { "value": "nope" }
        });
        let mut entries = history_from_document(&doc);
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "a");
        assert_eq!(entries[0].rollback_target(), Some(100));
        assert!(!entries[1].is_rollback_eligible());
    }

    #[test]
    fn legacy_entry_without_previous_value_is_not_eligible() {
        let doc = json!({
            "x": { "value": 10, "updatedAt": "2024-03-01T10:00:00Z", "type": "set" }
        });
        let entries = history_from_document(&doc);
        assert!(!entries[0].is_rollback_eligible());
    }

    #[test]
    fn inactive_special_drops_payload() {
        let s = SpecialAnimation::from_document(&json!({ "active": false, "message": "old" }));
        assert_eq!(s, SpecialAnimation::idle());

        let s = SpecialAnimation::from_document(&json!({ "active": true, "message": "Tak!", "amount": 5000 }));
        assert_eq!(s, SpecialAnimation::announcing(Some("Tak!".into()), Some(5000)));
    }

    #[test]
    fn idle_mirror_deletes_fields() {
        let patch = SpecialAnimation::idle().counter_mirror();
        assert!(patch.values().all(Value::is_null));
        assert_eq!(patch.len(), 3);
    }
}
