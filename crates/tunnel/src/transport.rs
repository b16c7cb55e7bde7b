// Transport seam between the forwarding engine and the SSH stack

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use pgtunnel_common::{Result, SshConfig};

/// Streams usable as the remote half of a relay session.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type alias for boxed logical-channel streams.
pub type BoxedStream = Box<dyn TransportStream>;

/// An authenticated, multiplexing transport that can open logical channels to
/// remote TCP endpoints. Channel opens may run concurrently from independent
/// sessions.
#[async_trait]
pub trait ForwardTransport: Send + Sync {
    /// Open a `direct-tcpip` channel to `target_host:target_port`, reporting
    /// `origin_host:origin_port` as the originator of the connection.
    async fn open_direct_tcpip(
        &self,
        target_host: &str,
        target_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<BoxedStream>;

    /// Close the transport. Subsequent channel opens fail.
    async fn close(&self) -> Result<()>;
}

/// Establishes a [`ForwardTransport`] from an SSH configuration.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn ForwardTransport>>;
}
