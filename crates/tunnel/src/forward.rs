// Local forward listener and its session registry

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use pgtunnel_common::{Error, Result, TunnelOptions};

use crate::relay;
use crate::transport::ForwardTransport;

const ACCEPT_STOP_TIMEOUT: Duration = Duration::from_millis(100);

/// Live relay sessions spawned by one forward listener.
pub struct SessionRegistry {
    cancel_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRegistry {
    fn new() -> Self {
        let (cancel_tx, _) = broadcast::channel(1);
        Self {
            cancel_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn register(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Number of sessions still relaying.
    pub async fn active(&self) -> usize {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.cancel_tx.subscribe()
    }

    /// Cancel every session and wait for the set to drain, aborting whatever
    /// is still running at the deadline.
    async fn shutdown(&self, drain_timeout: Duration) {
        let _ = self.cancel_tx.send(());

        let deadline = Instant::now() + drain_timeout;
        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

/// Handle to a running forward listener.
pub struct Forwarder {
    local_port: u16,
    shutdown_tx: mpsc::Sender<()>,
    accept_task: JoinHandle<()>,
    sessions: Arc<SessionRegistry>,
}

impl Forwarder {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.active().await
    }

    /// Stop accepting, then cancel and drain live sessions.
    pub async fn shutdown(mut self, drain_timeout: Duration) {
        let _ = self.shutdown_tx.send(()).await;
        if timeout(ACCEPT_STOP_TIMEOUT, &mut self.accept_task)
            .await
            .is_err()
        {
            self.accept_task.abort();
        }
        self.sessions.shutdown(drain_timeout).await;
    }
}

/// Bind `127.0.0.1:local_port` and accept in the background. Each accepted
/// connection gets its own relay session over a fresh logical channel to
/// `target_host:target_port`.
pub async fn start_forwarding(
    local_port: u16,
    target_host: &str,
    target_port: u16,
    transport: Arc<dyn ForwardTransport>,
    options: &TunnelOptions,
) -> Result<Forwarder> {
    let bind_addr = format!("127.0.0.1:{}", local_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| Error::Connect(format!("failed to bind {}: {}", bind_addr, e)))?;

    info!("Forwarding {} -> {}:{}", bind_addr, target_host, target_port);

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let sessions = Arc::new(SessionRegistry::new());

    let accept_task = tokio::spawn(accept_loop(
        listener,
        target_host.to_string(),
        target_port,
        transport,
        sessions.clone(),
        options.chunk_size,
        options.idle_timeout(),
        shutdown_rx,
    ));

    Ok(Forwarder {
        local_port,
        shutdown_tx,
        accept_task,
        sessions,
    })
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    target_host: String,
    target_port: u16,
    transport: Arc<dyn ForwardTransport>,
    sessions: Arc<SessionRegistry>,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Forward listener shutting down");
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);

                        let transport = transport.clone();
                        let target_host = target_host.clone();
                        let cancel = sessions.subscribe();
                        let handle = tokio::spawn(async move {
                            handle_connection(
                                stream,
                                peer_addr,
                                &target_host,
                                target_port,
                                transport,
                                chunk_size,
                                idle_timeout,
                                cancel,
                            )
                            .await;
                        });
                        sessions.register(handle).await;
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    target_host: &str,
    target_port: u16,
    transport: Arc<dyn ForwardTransport>,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
    cancel: broadcast::Receiver<()>,
) {
    // A refused channel ends this session only; the listener keeps accepting.
    let channel = match transport
        .open_direct_tcpip(
            target_host,
            target_port,
            &peer_addr.ip().to_string(),
            peer_addr.port(),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Failed to open channel for {}: {}", peer_addr, e);
            return;
        }
    };

    relay::run_session(stream, channel, chunk_size, idle_timeout, cancel).await;
}
