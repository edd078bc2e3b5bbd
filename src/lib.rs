//! Donation tally kept in sync across every connected display and admin
//! panel, with special-donation announcements.

pub mod actions;
pub mod config;
pub mod error;
pub mod render;
pub mod server;
pub mod state;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod topics;

pub const SERVICE_ID: &str = "tally-relay";
