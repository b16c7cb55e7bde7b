// SSH transport implementation using russh

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use pgtunnel_common::{format_host_port, Error, Result, SshConfig, SshCredential};

use crate::transport::{BoxedStream, ForwardTransport, TransportConnector};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// SSH client handler carrying the host identity policy.
struct TunnelHandler {
    host: String,
    port: u16,
    pinned_fingerprint: Option<String>,
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = key_fingerprint(server_public_key);

        match &self.pinned_fingerprint {
            Some(expected) if *expected == fingerprint => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Some(expected) => {
                warn!(
                    "Host key mismatch for {}:{}: expected {}, got {}",
                    self.host, self.port, expected, fingerprint
                );
                Ok(false)
            }
            None => {
                // No pinned fingerprint: any server identity is accepted.
                // Trust-on-first-use weakness; pin a fingerprint to harden.
                debug!(
                    "Accepting unverified host key for {}:{} ({})",
                    self.host, self.port, fingerprint
                );
                Ok(true)
            }
        }
    }
}

/// OpenSSH-style fingerprint of a server key.
fn key_fingerprint(key: &russh::keys::PublicKey) -> String {
    use russh::keys::PublicKeyBase64;

    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    format!("SHA256:{}", STANDARD.encode(hasher.finalize()))
}

/// Connects and authenticates SSH transports with russh.
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn ForwardTransport>> {
        let credential = config.credential()?;

        let mut cfg = Config::default();
        // disable nagle for lower latency on forwarded traffic
        cfg.nodelay = true;
        // keepalives so idle tunnels do not die silently
        cfg.keepalive_interval = Some(KEEPALIVE_INTERVAL);
        cfg.keepalive_max = 3;

        let addr = format_host_port(&config.host, config.port);
        info!("Connecting to SSH server: {}", addr);

        let handler = TunnelHandler {
            host: config.host.clone(),
            port: config.port,
            pinned_fingerprint: config.host_key_fingerprint.clone(),
        };

        let mut session = match tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::new(cfg), addr.as_str(), handler),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(Error::Connect(format!(
                    "failed to connect to {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                return Err(Error::Connect(format!(
                    "connection to {} timed out after {:?}",
                    addr, self.connect_timeout
                )));
            }
        };

        match credential {
            SshCredential::Key { path, passphrase } => {
                authenticate_with_key(&mut session, &config.user, path, passphrase).await?;
            }
            SshCredential::Password(password) => {
                authenticate_with_password(&mut session, &config.user, password).await?;
            }
        }

        info!("SSH authentication successful");
        Ok(Arc::new(SshTransport { handle: session }))
    }
}

/// Authenticate using an SSH key (with optional passphrase)
async fn authenticate_with_key(
    session: &mut Handle<TunnelHandler>,
    user: &str,
    key_path: &Path,
    passphrase: Option<&str>,
) -> Result<()> {
    info!("Authenticating with key: {}", key_path.display());

    let key = load_secret_key(key_path, passphrase).map_err(|e| {
        Error::Connect(format!(
            "failed to load SSH key from {}: {}",
            key_path.display(),
            e
        ))
    })?;

    // Hash algorithm only matters for RSA keys; others ignore it.
    let hash_alg = session
        .best_supported_rsa_hash()
        .await
        .map_err(|e| Error::Connect(format!("failed to negotiate RSA hash: {}", e)))?
        .flatten();
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

    let auth_result = session
        .authenticate_publickey(user, key_with_alg)
        .await
        .map_err(|e| Error::Connect(format!("public key authentication failed: {}", e)))?;

    match auth_result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods, ..
        } => Err(Error::Connect(format!(
            "public key authentication rejected. {}",
            describe_methods(&remaining_methods)
        ))),
    }
}

/// Authenticate using a password
async fn authenticate_with_password(
    session: &mut Handle<TunnelHandler>,
    user: &str,
    password: &str,
) -> Result<()> {
    info!("Authenticating with password");

    let auth_result = session
        .authenticate_password(user, password)
        .await
        .map_err(|e| Error::Connect(format!("password authentication failed: {}", e)))?;

    match auth_result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods, ..
        } => Err(Error::Connect(format!(
            "password authentication rejected. {}",
            describe_methods(&remaining_methods)
        ))),
    }
}

fn describe_methods(methods: &russh::MethodSet) -> String {
    let methods: Vec<String> = methods
        .iter()
        .map(|m| {
            let s: &str = m.into();
            s.to_string()
        })
        .collect();

    if methods.is_empty() {
        "No authentication methods available".to_string()
    } else {
        format!("Server requires: {}", methods.join(", "))
    }
}

/// An established SSH session used as a channel multiplexer.
struct SshTransport {
    handle: Handle<TunnelHandler>,
}

#[async_trait]
impl ForwardTransport for SshTransport {
    async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                target_host,
                target_port.into(),
                origin_host,
                origin_port.into(),
            )
            .await
            .map_err(|e| {
                Error::ChannelOpen(format!("{}:{}: {}", target_host, target_port, e))
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::Connect(format!("failed to disconnect: {}", e)))?;
        Ok(())
    }
}
