//! HTTP request handlers for health and administration.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    response::IntoResponse,
};
use tracing::debug;

use super::types::*;
use super::AppState;
use crate::actions::amount_from_input;
use crate::render::{DisplayFrame, render};
use crate::state::{CounterState, SpecialAnimation};
use crate::store::COUNTER_KEY;

// ═══════════════════════════════════════════════════════════════════════════
// Health
// ═══════════════════════════════════════════════════════════════════════════

/// Handler for `GET /health`.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// ═══════════════════════════════════════════════════════════════════════════
// Read side
// ═══════════════════════════════════════════════════════════════════════════

async fn counter_response(state: &AppState) -> CounterResponse {
    let value = state.admin.current();
    // Timestamp is informational; an offline store just leaves it out.
    let updated_at = match state.bridge.store().get(COUNTER_KEY).await {
        Ok(snapshot) => CounterState::from_document(snapshot.document())
            .filter(|stored| stored.value == value)
            .and_then(|stored| stored.updated_at),
        Err(e) => {
            debug!(error = %e, "Counter timestamp unavailable");
            None
        }
    };
    CounterResponse {
        value,
        updated_at,
        connected: state.bridge.is_connected(),
    }
}

/// Handler for `GET /api/counter`.
pub async fn counter_handler(State(state): State<AppState>) -> Json<CounterResponse> {
    Json(counter_response(&state).await)
}

/// Handler for `GET /api/display` - what a display should show right now.
pub async fn display_handler(State(state): State<AppState>) -> Json<DisplayFrame> {
    Json(render(
        state.admin.current(),
        &state.special.state(),
        state.special.remaining(),
    ))
}

/// Handler for `GET /api/special`.
pub async fn special_handler(State(state): State<AppState>) -> Json<SpecialAnimation> {
    Json(state.special.state())
}

/// Handler for `GET /api/history`.
pub async fn history_handler(
    State(state): State<AppState>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let entries = state.admin.history().await?;
    Ok(Json(HistoryResponse {
        entries: entries.into_iter().map(HistoryItem::from).collect(),
    }))
}

// ═══════════════════════════════════════════════════════════════════════════
// Writes
// ═══════════════════════════════════════════════════════════════════════════

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(request)| request)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// Handler for `POST /api/counter/set`.
pub async fn set_handler(
    State(state): State<AppState>,
    payload: Result<Json<SetRequest>, JsonRejection>,
) -> Result<Json<CounterResponse>, ApiError> {
    let request = body(payload)?;
    let value = amount_from_input(&request.value)?;
    state.admin.set(value).await?;
    Ok(Json(counter_response(&state).await))
}

/// Handler for `POST /api/counter/add`.
pub async fn add_handler(
    State(state): State<AppState>,
    payload: Result<Json<AddRequest>, JsonRejection>,
) -> Result<Json<CounterResponse>, ApiError> {
    let request = body(payload)?;
    let amount = amount_from_input(&request.amount)?;
    state.admin.add(amount).await?;
    Ok(Json(counter_response(&state).await))
}

/// Handler for `POST /api/counter/special` - add a special donation and
/// announce it on every display.
pub async fn special_donation_handler(
    State(state): State<AppState>,
    payload: Result<Json<SpecialRequest>, JsonRejection>,
) -> Result<Json<CounterResponse>, ApiError> {
    let request = body(payload)?;
    let amount = amount_from_input(&request.amount)?;
    state.admin.special(amount, request.message).await?;
    Ok(Json(counter_response(&state).await))
}

/// Handler for `POST /api/counter/reset`.
pub async fn reset_handler(
    State(state): State<AppState>,
) -> Result<Json<CounterResponse>, ApiError> {
    state.admin.reset().await?;
    Ok(Json(counter_response(&state).await))
}

/// Handler for `POST /api/history/{id}/rollback`.
pub async fn rollback_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CounterResponse>, ApiError> {
    state.admin.rollback(&id).await?;
    Ok(Json(counter_response(&state).await))
}
