//! kiln server entry point.

use kiln_server::{ensure_booting, http, KilnConfig};
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "kiln_server=info,kiln_core=info,kiln_gen=info,kiln_runtime=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting kiln server");

    let config = match KilnConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    tracing::info!(?config, "Configuration loaded");

    let state = kiln_server::build_local_state(&config)?;
    let manager = state.workspace.manager().clone();

    // Boot eagerly so the preview is warm by the time a client asks.
    ensure_booting(&manager);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let http_addr = config.http_addr;
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        if let Err(e) = http::serve(state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });
    tracing::info!(addr = %http_addr, "Server ready");

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());
    manager.shutdown().await;
    let _ = http_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
