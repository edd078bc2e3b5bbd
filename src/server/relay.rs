//! WebSocket relay.
//!
//! Each socket is a session. A count sent by one session goes to every other
//! session; the sender already shows it and does not get it back.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::registry::SessionGuard;
use super::AppState;
use crate::error::ValidationError;
use crate::state::record::count_from_value;
use crate::topics::{ClientMessage, CountChanged, ServerMessage, SessionId, UPDATE_COUNT};

/// Handler for `GET /socket`.
pub async fn socket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let joined = state.registry.join();
    let guard = SessionGuard::new(state.registry.clone(), joined.id);
    let session = guard.id();
    info!(%session, clients = state.registry.client_count(), "Relay client connected");

    let mut updates = joined.updates;
    if send(&mut socket, &ServerMessage::CountUpdate(joined.count))
        .await
        .is_err()
    {
        return;
    }
    if joined.special.active
        && send(&mut socket, &ServerMessage::SpecialUpdate(joined.special))
            .await
            .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            update = updates.recv() => {
                let outgoing = match update {
                    Ok(CountChanged::Count { origin: Some(origin), .. }) if origin == session => None,
                    Ok(CountChanged::Count { value, .. }) => Some(ServerMessage::CountUpdate(value)),
                    Ok(CountChanged::Special(special)) => Some(ServerMessage::SpecialUpdate(special)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%session, skipped, "Relay client lagged, resending current count");
                        Some(ServerMessage::CountUpdate(state.registry.current()))
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Some(msg) = outgoing {
                    if send(&mut socket, &msg).await.is_err() {
                        break;
                    }
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if handle_text(&mut socket, &state, session, text.as_str()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    drop(guard);
    info!(%session, clients = state.registry.client_count(), "Relay client disconnected");
}

async fn handle_text(
    socket: &mut WebSocket,
    state: &AppState,
    session: SessionId,
    text: &str,
) -> Result<(), axum::Error> {
    match interpret(text) {
        Ok(Some(value)) => {
            let recipients = state.registry.relay(value, session);
            info!(%session, value, recipients, "Relayed count");
            state.persist_relay(value).await;
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(reason) => {
            debug!(%session, %reason, "Rejected relay message");
            send(socket, &ServerMessage::Error(reason)).await
        }
    }
}

/// Decode one client frame. `Ok(None)` for events the relay does not handle.
fn interpret(text: &str) -> Result<Option<i64>, String> {
    let msg: ClientMessage =
        serde_json::from_str(text).map_err(|_| "Invalid message".to_string())?;
    if msg.event != UPDATE_COUNT {
        return Ok(None);
    }
    count_from_value(&msg.data)
        .map(Some)
        .ok_or_else(|| ValidationError::NotANumber.to_string())
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(e) => {
            warn!(error = %e, "Failed to encode relay message");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_count_carries_number() {
        assert_eq!(
            interpret(r#"{"event":"update-count","data":1500}"#),
            Ok(Some(1500))
        );
        assert_eq!(
            interpret(r#"{"event":"update-count","data":1500.0}"#),
            Ok(Some(1500))
        );
    }

    #[test]
    fn non_numeric_count_is_rejected_with_reason() {
        assert_eq!(
            interpret(r#"{"event":"update-count","data":"abc"}"#),
            Err("Invalid count value".to_string())
        );
        assert_eq!(
            interpret(r#"{"event":"update-count"}"#),
            Err("Invalid count value".to_string())
        );
        assert!(interpret("not json").is_err());
    }

    #[test]
    fn other_events_are_ignored() {
        assert_eq!(interpret(r#"{"event":"ping","data":null}"#), Ok(None));
    }
}
