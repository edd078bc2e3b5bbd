use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use tally_relay::SERVICE_ID;
use tally_relay::config::Config;
use tally_relay::server::Server;
use tally_relay::store::MemoryStore;
use tally_relay::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.mode)?;
    info!(service = SERVICE_ID, mode = ?config.mode, "Starting counter server");

    let store = match &config.snapshot {
        Some(path) => {
            let store = MemoryStore::load(path)
                .with_context(|| format!("failed to load snapshot {}", path.display()))?;
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let handle = Server::new(config.server_config(), store.clone())
        .start()
        .await
        .with_context(|| format!("failed to start server on {}", config.listen_addr()))?;

    info!(addr = %handle.local_addr(), "Counter server started, press Ctrl+C to stop");
    shutdown_signal().await;

    info!("Initiating graceful shutdown...");
    handle.shutdown().await;

    if let Some(path) = &config.snapshot {
        store
            .persist(path)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        info!(path = %path.display(), "Wrote store snapshot");
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. If a handler cannot be installed the other
/// one still works; if neither can, the server runs until killed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
