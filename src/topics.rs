//! Event names and messages exchanged with connected clients.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::SpecialAnimation;

/// Server → client: the current count.
pub const COUNT_UPDATE: &str = "count-update";
/// Client → server: a new count from this client.
pub const UPDATE_COUNT: &str = "update-count";
/// Server → client: the special announcement changed.
pub const SPECIAL_UPDATE: &str = "special-update";
/// Server → client: the last message from this client was rejected.
pub const ERROR: &str = "error";

/// SSE event name used for special announcements. Count events are unnamed
/// so plain `onmessage` handlers keep working.
pub const SSE_SPECIAL: &str = "special";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Fan-out message inside the relay.
#[derive(Clone, Debug, PartialEq)]
pub enum CountChanged {
    Count {
        value: i64,
        /// Session that submitted the value; it is not sent back there.
        origin: Option<SessionId>,
    },
    Special(SpecialAnimation),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "count-update")]
    CountUpdate(i64),
    #[serde(rename = "special-update")]
    SpecialUpdate(SpecialAnimation),
    #[serde(rename = "error")]
    Error(String),
}

/// Client → server envelope. `data` stays raw so a bad payload can be
/// answered with a message instead of a dropped connection.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
