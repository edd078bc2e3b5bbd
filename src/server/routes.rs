//! Route configuration.

use axum::{
    Router,
    http::{Method, header},
    routing::{get, post},
};
use const_format::concatcp;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::AppState;
use super::events::{broadcast_handler, subscribe_handler};
use super::handlers::*;
use super::relay::socket_handler;

pub const HEALTH_PATH: &str = "/health";
pub const EVENTS_PATH: &str = "/events";
pub const SOCKET_PATH: &str = "/socket";

pub const API_PREFIX: &str = "/api";
pub const COUNTER_PATH: &str = concatcp!(API_PREFIX, "/counter");
pub const DISPLAY_PATH: &str = concatcp!(API_PREFIX, "/display");
pub const SPECIAL_PATH: &str = concatcp!(API_PREFIX, "/special");
pub const SET_PATH: &str = concatcp!(COUNTER_PATH, "/set");
pub const ADD_PATH: &str = concatcp!(COUNTER_PATH, "/add");
pub const SPECIAL_DONATION_PATH: &str = concatcp!(COUNTER_PATH, "/special");
pub const RESET_PATH: &str = concatcp!(COUNTER_PATH, "/reset");
pub const HISTORY_PATH: &str = concatcp!(API_PREFIX, "/history");
pub const ROLLBACK_PATH: &str = concatcp!(HISTORY_PATH, "/{id}/rollback");

/// Create the full router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_handler))
        // Real-time fan-out
        .route(EVENTS_PATH, get(subscribe_handler).post(broadcast_handler))
        .route(SOCKET_PATH, get(socket_handler))
        // Admin API
        .route(COUNTER_PATH, get(counter_handler))
        .route(DISPLAY_PATH, get(display_handler))
        .route(SPECIAL_PATH, get(special_handler))
        .route(SET_PATH, post(set_handler))
        .route(ADD_PATH, post(add_handler))
        .route(SPECIAL_DONATION_PATH, post(special_donation_handler))
        .route(RESET_PATH, post(reset_handler))
        .route(HISTORY_PATH, get(history_handler))
        .route(ROLLBACK_PATH, post(rollback_handler))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Any origin may connect. The origin is mirrored rather than `*` so
/// credentialed requests keep working.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}
