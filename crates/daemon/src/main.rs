// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 pgtunnel Contributors

// pgtunnel - Daemon
// Hosting-process shell: establishes the database tunnel at startup, prints
// the connection URL for the application to consume, and keeps the forward
// alive until the process is told to stop.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgtunnel::TunnelManager;
use pgtunnel_common::TunnelConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgtunnel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("pgtunnel daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config().context("Failed to load configuration")?;
    let manager = TunnelManager::new(config);

    // Startup must fail loudly on configuration or connection problems.
    let url = manager
        .database_url()
        .await
        .context("Failed to construct database URL")?;

    match manager.local_port().await {
        Some(port) => info!("Database reachable through 127.0.0.1:{}", port),
        None => info!("Direct database connection, no tunnel in use"),
    }

    // The URL carries credentials, so it goes to stdout for the hosting
    // application rather than into the logs.
    println!("{}", url);

    wait_for_shutdown().await;

    manager.close_tunnel().await.context("Failed to close tunnel")?;
    info!("Daemon shut down");
    Ok(())
}

/// Load configuration from the file named by `PGTUNNEL_CONFIG`, or from the
/// process environment when no file is configured.
fn load_config() -> Result<TunnelConfig> {
    match std::env::var("PGTUNNEL_CONFIG") {
        Ok(path) => {
            let path = PathBuf::from(path);
            info!("Loading configuration from {}", path.display());
            Ok(TunnelConfig::load(&path)?)
        }
        Err(_) => Ok(TunnelConfig::from_env()?),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}
