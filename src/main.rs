//! World Icon Server
//!
//! Runs the marker registry on a dedicated simulation thread and shuts down
//! cleanly on Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use worldicon_server::config::ServerConfig;
use worldicon_server::net::directory::ClientDirectory;
use worldicon_server::state::AppState;
use worldicon_server::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration decides the log format, so it is loaded first
    let config = ServerConfig::load().await?;

    // Initialize logging
    init_logging(&config);

    info!("World Icon Server v{}", VERSION);
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize application state and the world that owns the registry
    let (state, mut world) = AppState::new(config.clone(), shutdown_tx.clone());
    let state = Arc::new(state);
    info!("Application state initialized");

    // The registry is single-owner: run it on its own thread
    let events = state.clients.subscribe();
    let mut world_shutdown_rx = shutdown_tx.subscribe();
    let simulation = thread::Builder::new()
        .name("simulation".to_string())
        .spawn(move || -> Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build simulation runtime")?;
            runtime.block_on(world.run(events, &mut world_shutdown_rx));
            Ok(())
        })
        .context("Failed to spawn simulation thread")?;

    info!("Server startup complete!");
    info!("{} is ready", config.server_name);

    // Wait for shutdown signal
    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");

    // Wait for the simulation thread to finish
    match tokio::task::spawn_blocking(move || simulation.join()).await {
        Ok(Ok(result)) => result?,
        Ok(Err(_)) => error!("Simulation thread panicked"),
        Err(e) => error!(error = %e, "Failed to join simulation thread"),
    }

    info!(
        connected_clients = state.clients.client_count(),
        "Server shutdown complete. Goodbye!"
    );
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(config: &ServerConfig) {
    let default_filter = if config.debug {
        "debug"
    } else {
        "info,worldicon_server=debug"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
