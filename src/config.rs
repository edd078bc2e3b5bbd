//! Process configuration. Every option can come from the environment, so the
//! server normally runs with no flags at all.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use crate::server::ServerConfig;
use crate::store::ConflictPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Development,
    Production,
}

impl RunMode {
    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_filter(self) -> &'static str {
        match self {
            RunMode::Development => "info,tally_relay=debug,counter_server=debug",
            RunMode::Production => "info",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "counter-server", version, about = "Synchronized donation tally relay")]
pub struct Config {
    /// Run mode; selects log verbosity and formatting
    #[arg(long, env = "TALLY_ENV", value_enum, default_value_t = RunMode::Development)]
    pub mode: RunMode,

    /// Address to listen on
    #[arg(long, env = "TALLY_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// How long a special announcement stays on screen (seconds)
    #[arg(long, env = "TALLY_SPECIAL_SECS", default_value_t = 10)]
    pub special_secs: u64,

    /// Delay between store reconnect attempts (milliseconds)
    #[arg(long, env = "TALLY_RECONNECT_MS", default_value_t = 3000)]
    pub reconnect_ms: u64,

    /// An unchanged count posted within this window is not re-broadcast (seconds)
    #[arg(long, env = "TALLY_UNCHANGED_WINDOW_SECS", default_value_t = 5)]
    pub unchanged_window_secs: u64,

    /// Number of history entries shown to admins
    #[arg(long, env = "TALLY_HISTORY_WINDOW", default_value_t = 20)]
    pub history_window: usize,

    /// Persist counts received over the relay to the store
    #[arg(long, env = "TALLY_RELAY_PERSIST", default_value_t = true, action = ArgAction::Set)]
    pub relay_persist: bool,

    /// How concurrent admin writes are reconciled
    #[arg(long, env = "TALLY_CONFLICT_POLICY", value_enum, default_value_t = ConflictPolicy::LastWriteWins)]
    pub conflict_policy: ConflictPolicy,

    /// Snapshot file for the in-process store (loaded at start, written at stop)
    #[arg(long, env = "TALLY_SNAPSHOT")]
    pub snapshot: Option<PathBuf>,

    /// Counter value used when the store holds none
    #[arg(long, env = "TALLY_INITIAL_VALUE", default_value_t = 0, allow_negative_numbers = true)]
    pub initial_value: i64,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen_addr(),
            special_duration: Duration::from_secs(self.special_secs),
            reconnect_backoff: Duration::from_millis(self.reconnect_ms),
            unchanged_window: Duration::from_secs(self.unchanged_window_secs),
            history_window: self.history_window,
            relay_persist: self.relay_persist,
            conflict_policy: self.conflict_policy,
            initial_value: self.initial_value,
        }
    }
}
