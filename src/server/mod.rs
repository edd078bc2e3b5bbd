//! Relay server: SSE broadcast endpoint, WebSocket relay and admin API.

mod events;
mod handlers;
mod registry;
mod relay;
mod routes;
mod types;

pub use events::UNCHANGED_MESSAGE;
pub use registry::{DEFAULT_UNCHANGED_WINDOW, Joined, SessionGuard, SessionRegistry, Submitted};
pub use routes::*;
pub use types::*;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::history::DEFAULT_HISTORY_WINDOW;
use crate::actions::special::DEFAULT_DISPLAY_DURATION;
use crate::actions::{Admin, HistoryLog, SpecialChannel};
use crate::error::StoreError;
use crate::state::{CounterHolder, init_or_load_counter};
use crate::store::{ConflictPolicy, Store};
use crate::sync::{BridgeConfig, DEFAULT_RECONNECT_BACKOFF, SyncBridge};

/// Errors from starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Failed to load counter: {0}")]
    Store(#[from] StoreError),
}

/// Configuration for the relay server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// How long a special announcement stays on screen.
    pub special_duration: Duration,
    /// Delay between store reconnect attempts.
    pub reconnect_backoff: Duration,
    /// An unchanged posted count within this window is not re-broadcast.
    pub unchanged_window: Duration,
    /// Number of history entries returned to admins.
    pub history_window: usize,
    /// Write counts received from clients through to the store.
    pub relay_persist: bool,
    pub conflict_policy: ConflictPolicy,
    /// Counter value used when the store holds none.
    pub initial_value: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            special_duration: DEFAULT_DISPLAY_DURATION,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            unchanged_window: DEFAULT_UNCHANGED_WINDOW,
            history_window: DEFAULT_HISTORY_WINDOW,
            relay_persist: true,
            conflict_policy: ConflictPolicy::LastWriteWins,
            initial_value: 0,
        }
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub admin: Arc<Admin>,
    pub bridge: Arc<SyncBridge>,
    pub special: SpecialChannel,
    pub relay_persist: bool,
    /// Cancelled on shutdown; ends open streams and background tasks.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire up the counter, bridge, special channel and admin surface over
    /// `store`, loading (or seeding) the current count.
    pub async fn new(config: &ServerConfig, store: Arc<dyn Store>) -> Result<Self, StoreError> {
        let initial = init_or_load_counter(store.as_ref(), config.initial_value).await?;
        let holder = CounterHolder::new(initial);
        holder.mark_synced(initial);

        let special = SpecialChannel::new(store.clone(), config.special_duration);
        let bridge = Arc::new(
            SyncBridge::new(
                store.clone(),
                holder,
                BridgeConfig {
                    reconnect_backoff: config.reconnect_backoff,
                    policy: config.conflict_policy,
                },
            )
            .with_special(special.clone()),
        );
        let history = HistoryLog::new(store, config.history_window);
        let admin = Arc::new(Admin::new(bridge.clone(), history, special.clone()));

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(initial, config.unchanged_window)),
            admin,
            bridge,
            special,
            relay_persist: config.relay_persist,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the store subscription and the forwarders that fan store-side
    /// changes out to connected sessions.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let bridge = self.bridge.spawn(self.shutdown.clone());

        let counter = {
            let mut changes = self.bridge.holder().watch();
            let registry = self.registry.clone();
            let cancel = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = changes.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let value = changes.borrow_and_update().value;
                            if registry.observe(value) {
                                debug!(value, "Store change fanned out");
                            }
                        }
                    }
                }
            })
        };

        let special = {
            let mut changes = self.special.watch();
            let registry = self.registry.clone();
            let cancel = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = changes.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let event = changes.borrow_and_update().clone();
                            registry.observe_special(event);
                        }
                    }
                }
            })
        };

        vec![bridge, counter, special]
    }

    /// Write a client-submitted count through to the store, if configured.
    /// Failures are logged; the relay has already delivered the value.
    pub async fn persist_relay(&self, value: i64) {
        if !self.relay_persist {
            return;
        }
        let Some(update) = self.bridge.holder().set_value(value) else {
            return;
        };
        if let Err(e) = self.bridge.publish(update).await {
            warn!(value, error = %e, "Failed to persist relayed count");
        }
    }
}

/// Handle for controlling a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: AppState,
    task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address actually bound; differs from the configured one for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting, close open streams, stop the bridge and the special
    /// timer, and wait for all of it to finish.
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = ?e, "Server task failed");
        }
        for task in self.background {
            if let Err(e) = task.await {
                error!(error = ?e, "Background task failed");
            }
        }
        self.state.special.shutdown();
        info!("Server stopped");
    }
}

pub struct Server {
    config: ServerConfig,
    store: Arc<dyn Store>,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        Self { config, store }
    }

    /// Load state, bind, and serve in the background.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let state = AppState::new(&self.config, self.store).await?;
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, value = state.admin.current(), "Counter server listening");

        let background = state.spawn_background();
        let router = create_router(state.clone());
        let shutdown = state.shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = ?e, "Server error");
            }
        });

        Ok(ServerHandle {
            local_addr,
            state,
            task,
            background,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::topics::CountChanged;

    fn local_config() -> ServerConfig {
        ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.special_duration, Duration::from_secs(10));
        assert_eq!(config.history_window, 20);
        assert!(config.relay_persist);
    }

    #[tokio::test]
    async fn admin_write_reaches_sessions() {
        let store = Arc::new(MemoryStore::new());
        let handle = Server::new(local_config(), store).start().await.unwrap();
        let state = handle.state().clone();
        let mut joined = state.registry.join();

        state.admin.set(77).await.unwrap();
        loop {
            if let CountChanged::Count { value: 77, origin } = joined.updates.recv().await.unwrap() {
                assert_eq!(origin, None);
                break;
            }
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn relayed_count_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let state = AppState::new(&ServerConfig::default(), dyn_store).await.unwrap();

        state.persist_relay(42).await;
        let snap = store.get(crate::store::COUNTER_KEY).await.unwrap();
        assert_eq!(snap.document()["value"], 42);
    }

    #[tokio::test]
    async fn relay_persistence_can_be_disabled() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let config = ServerConfig {
            relay_persist: false,
            ..ServerConfig::default()
        };
        let state = AppState::new(&config, dyn_store).await.unwrap();
        let version = store.get(crate::store::COUNTER_KEY).await.unwrap().version;

        state.persist_relay(42).await;
        assert_eq!(
            store.get(crate::store::COUNTER_KEY).await.unwrap().version,
            version
        );
        assert_eq!(state.admin.current(), 0);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = Server::new(local_config(), Arc::new(MemoryStore::new()))
            .start()
            .await
            .unwrap();
        let taken = ServerConfig {
            listen_addr: first.local_addr(),
            ..ServerConfig::default()
        };
        let second = Server::new(taken, Arc::new(MemoryStore::new())).start().await;
        assert!(matches!(second, Err(ServerError::Bind(_))));
        first.shutdown().await;
    }
}
