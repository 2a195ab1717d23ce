//! tailond: application supervisor daemon
//!
//! Loads the configured applications, serves the HTTP control API and, on
//! SIGINT or SIGTERM, drains the server before stopping every supervised
//! process.

mod api;
mod auth;
mod caller;
mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tailon_supervisor::Manager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;

#[derive(Parser, Debug)]
#[command(name = "tailond", version, about = "Supervise applications and control them over HTTP")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.json);

    info!("tailond starting...");

    let config = config::load_config(&args.config)?;
    let addr = config.listen_addr()?;
    info!(
        applications = config.applications.len(),
        default_role = %config.security.default_role,
        "Configuration loaded"
    );

    let manager = Manager::new(config.applications.clone(), config.manager_options());
    let shutdown = CancellationToken::new();
    let state = ApiState {
        manager: manager.clone(),
        default_role: config.security.default_role,
        shutdown: shutdown.clone(),
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("API listening on http://{}", listener.local_addr()?);

    tokio::spawn(wait_for_signal(shutdown));
    api::serve(listener, state).await.context("HTTP server failed")?;

    info!("HTTP server stopped, stopping applications");
    if !manager.shutdown(config.shutdown_timeout()).await {
        warn!("Some applications did not stop within the shutdown timeout");
    }

    info!("tailond stopped");
    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .compact()
            .init();
    }
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
