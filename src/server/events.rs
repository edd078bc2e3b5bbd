//! Server-sent events broadcast endpoint.
//!
//! `GET /events` streams `{"count": N}` to every subscriber; `POST /events`
//! accepts a new count and fans it out.

use std::convert::Infallible;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, future, stream};
use serde_json::{Value, json};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use super::registry::{SessionGuard, Submitted};
use super::types::{ApiError, BroadcastResponse};
use super::AppState;
use crate::error::ValidationError;
use crate::state::SpecialAnimation;
use crate::state::record::count_from_value;
use crate::topics::{CountChanged, SSE_SPECIAL};

pub const UNCHANGED_MESSAGE: &str = "Value unchanged, no broadcast needed";

fn count_event(count: i64) -> Event {
    Event::default().data(json!({ "count": count }).to_string())
}

fn special_event(special: &SpecialAnimation) -> Event {
    Event::default()
        .event(SSE_SPECIAL)
        .data(special.to_document().to_string())
}

/// Handler for `GET /events`.
pub async fn subscribe_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let joined = state.registry.join();
    let guard = SessionGuard::new(state.registry.clone(), joined.id);
    info!(
        session = %joined.id,
        clients = state.registry.client_count(),
        "SSE client connected"
    );

    let mut initial = vec![count_event(joined.count)];
    if joined.special.active {
        initial.push(special_event(&joined.special));
    }

    let registry = state.registry.clone();
    let updates = BroadcastStream::new(joined.updates).filter_map(move |msg| {
        let event = match msg {
            Ok(CountChanged::Count { value, .. }) => Some(count_event(value)),
            Ok(CountChanged::Special(special)) => Some(special_event(&special)),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(session = %guard.id(), skipped, "SSE client lagged, resending current count");
                Some(count_event(registry.current()))
            }
        };
        future::ready(event)
    });

    let events = stream::iter(initial)
        .chain(updates)
        .map(Ok)
        .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Handler for `POST /events`.
///
/// The body must be JSON with a numeric `count`. Posting the value everyone
/// already has, shortly after the last update, is acknowledged without a
/// broadcast.
pub async fn broadcast_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<BroadcastResponse>, ApiError> {
    let payload: Value =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("Invalid JSON body"))?;
    let count = payload
        .get("count")
        .and_then(count_from_value)
        .ok_or(ValidationError::NotANumber)?;

    match state.registry.submit(count) {
        Submitted::Unchanged => {
            debug!(count, "Value unchanged, broadcast suppressed");
            Ok(Json(BroadcastResponse {
                success: true,
                count,
                clients: None,
                message: Some(UNCHANGED_MESSAGE.to_string()),
            }))
        }
        Submitted::Broadcast { recipients } => {
            info!(count, recipients, "Count broadcast");
            state.persist_relay(count).await;
            Ok(Json(BroadcastResponse {
                success: true,
                count,
                clients: Some(state.registry.client_count()),
                message: None,
            }))
        }
    }
}
