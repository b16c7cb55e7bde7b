// Tunnel lifecycle management

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info};

use pgtunnel_common::{database_url, Error, Result, TunnelConfig};

use crate::forward::{start_forwarding, Forwarder};
use crate::ssh::SshConnector;
use crate::transport::{ForwardTransport, TransportConnector};

/// Owns the SSH transport and the local forward listener for one database
/// endpoint. Establishment is lazy: the first `ensure_tunnel` call connects
/// and starts forwarding, later calls return the allocated port unchanged.
pub struct TunnelManager {
    config: TunnelConfig,
    connector: Arc<dyn TransportConnector>,
    // Held across establishment, so concurrent first callers single-flight.
    state: Mutex<Option<TunnelState>>,
}

struct TunnelState {
    local_port: u16,
    transport: Arc<dyn ForwardTransport>,
    forwarder: Forwarder,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        let connector = Arc::new(SshConnector::new(config.options.connect_timeout()));
        Self::with_connector(config, connector)
    }

    /// Build a manager over a custom transport connector. The seam tests and
    /// alternative transports go through.
    pub fn with_connector(config: TunnelConfig, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            config,
            connector,
            state: Mutex::new(None),
        }
    }

    /// Establish the tunnel if it is not already up and return the local
    /// forwarding port. A failed attempt leaves no state behind, so calling
    /// again retries from scratch; no backoff is applied here.
    pub async fn ensure_tunnel(&self) -> Result<u16> {
        let ssh = self.config.ssh.as_ref().ok_or_else(|| {
            Error::Config("no SSH endpoint configured; set SSH_HOST to enable the tunnel".to_string())
        })?;

        let mut state = self.state.lock().await;
        if let Some(state) = state.as_ref() {
            return Ok(state.local_port);
        }

        // Credential problems must surface before any network I/O.
        ssh.credential()?;

        let transport = self.connector.connect(ssh).await?;
        let local_port = allocate_local_port().await?;
        let forwarder = start_forwarding(
            local_port,
            &self.config.database.host,
            self.config.database.port,
            transport.clone(),
            &self.config.options,
        )
        .await?;

        info!(
            "Tunnel established: 127.0.0.1:{} -> {}:{}",
            local_port, self.config.database.host, self.config.database.port
        );

        *state = Some(TunnelState {
            local_port,
            transport,
            forwarder,
        });
        Ok(local_port)
    }

    /// Tear the tunnel down: stop accepting, drain live sessions, disconnect
    /// the transport. A no-op when no tunnel was ever established.
    pub async fn close_tunnel(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(TunnelState {
            local_port,
            transport,
            forwarder,
        }) = state.take()
        else {
            return Ok(());
        };

        forwarder.shutdown(self.config.options.drain_timeout()).await;
        if let Err(e) = transport.close().await {
            debug!("Failed to disconnect transport: {}", e);
        }

        info!("Tunnel on 127.0.0.1:{} closed", local_port);
        Ok(())
    }

    /// Connection URL for the configured database: through the tunnel when an
    /// SSH endpoint is configured (establishing it on first use), directly at
    /// the configured endpoint otherwise.
    pub async fn database_url(&self) -> Result<String> {
        if self.config.ssh.is_some() {
            let local_port = self.ensure_tunnel().await?;
            database_url(&self.config.database, "127.0.0.1", local_port)
        } else {
            database_url(
                &self.config.database,
                &self.config.database.host,
                self.config.database.port,
            )
        }
    }

    /// The allocated local port, if the tunnel is up.
    pub async fn local_port(&self) -> Option<u16> {
        self.state.lock().await.as_ref().map(|state| state.local_port)
    }

    /// Number of relay sessions currently running.
    pub async fn active_sessions(&self) -> usize {
        match self.state.lock().await.as_ref() {
            Some(state) => state.forwarder.active_sessions().await,
            None => 0,
        }
    }
}

/// Allocate an ephemeral local port by binding port 0 and reading back the
/// assignment. The probe socket is dropped so the forward listener can rebind
/// the same port.
async fn allocate_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| Error::Connect(format!("failed to allocate a local port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Connect(format!("failed to read allocated port: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}
