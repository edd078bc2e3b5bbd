//! Request and response types for the HTTP API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{AdminError, StoreError, ValidationError};
use crate::state::{HistoryEntry, HistoryKind};

// ═══════════════════════════════════════════════════════════════════════════
// Health
// ═══════════════════════════════════════════════════════════════════════════

/// Response for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Broadcast endpoint
// ═══════════════════════════════════════════════════════════════════════════

/// Response for `POST /events`.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastResponse {
    pub success: bool,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Admin
// ═══════════════════════════════════════════════════════════════════════════

/// Response for `GET /api/counter` and every counter write.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterResponse {
    pub value: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub connected: bool,
}

/// Body of `POST /api/counter/set`. `value` may be a number or admin-panel
/// text such as `"4.000.000"`.
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub value: Value,
}

/// Body of `POST /api/counter/add`.
#[derive(Debug, Clone, Deserialize)]
pub struct AddRequest {
    pub amount: Value,
}

/// Body of `POST /api/counter/special`.
#[derive(Debug, Clone, Deserialize)]
pub struct SpecialRequest {
    pub amount: Value,
    #[serde(default)]
    pub message: Option<String>,
}

/// One row of `GET /api/history`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    pub value: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<i64>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub can_rollback: bool,
}

impl From<HistoryEntry> for HistoryItem {
    fn from(entry: HistoryEntry) -> Self {
        let can_rollback = entry.is_rollback_eligible();
        Self {
            id: entry.id,
            value: entry.value,
            previous_value: entry.previous_value,
            updated_at: entry.updated_at,
            kind: entry.kind,
            added_amount: entry.added_amount,
            message: entry.message,
            can_rollback,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<HistoryItem>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error, rendered as `{"error": …}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::Disconnected => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<AdminError> for ApiError {
    fn from(e: AdminError) -> Self {
        match e {
            AdminError::Validation(e) => e.into(),
            AdminError::Store(e) => e.into(),
            AdminError::HistoryEntryNotFound(_) => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            AdminError::NotRollbackEligible(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_errors_map_to_statuses() {
        let cases = [
            (AdminError::from(ValidationError::Empty), StatusCode::BAD_REQUEST),
            (AdminError::HistoryEntryNotFound("x".into()), StatusCode::NOT_FOUND),
            (AdminError::NotRollbackEligible("x".into()), StatusCode::CONFLICT),
            (
                AdminError::Store(StoreError::Conflict {
                    key: "counter".into(),
                    reason: "version moved".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (AdminError::Store(StoreError::Disconnected), StatusCode::SERVICE_UNAVAILABLE),
            (
                AdminError::Store(StoreError::Malformed("counter".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn unchanged_broadcast_omits_clients() {
        let json = serde_json::to_value(BroadcastResponse {
            success: true,
            count: 3,
            clients: None,
            message: Some("Value unchanged, no broadcast needed".into()),
        })
        .unwrap();
        assert!(json.get("clients").is_none());
        assert_eq!(json["message"], "Value unchanged, no broadcast needed");
    }
}
