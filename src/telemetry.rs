use tracing_subscriber::EnvFilter;

use crate::config::RunMode;

/// Install the global `fmt` subscriber. `RUST_LOG` wins over the run mode's
/// default filter.
pub fn init_tracing(mode: RunMode) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(mode.default_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(mode == RunMode::Development)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
