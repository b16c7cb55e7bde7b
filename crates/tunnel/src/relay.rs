// Bidirectional relay between an accepted connection and a logical channel

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Default relay read chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Copy bytes between `a` and `b` in both directions until either side reads
/// EOF. Reads happen in chunks of up to `chunk_size` bytes and are written
/// verbatim to the other side; a slow reader blocks only this pair. With an
/// idle timeout set, `ErrorKind::TimedOut` is returned if no data moves in
/// either direction for that long. Returns the byte counts copied from `a`
/// and from `b`.
pub async fn copy_until_closed<A, B>(
    a: &mut A,
    b: &mut B,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut a_buf = vec![0u8; chunk_size];
    let mut b_buf = vec![0u8; chunk_size];
    let mut from_a = 0u64;
    let mut from_b = 0u64;

    loop {
        tokio::select! {
            read = a.read(&mut a_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                b.write_all(&a_buf[..n]).await?;
                from_a += n as u64;
            }

            read = b.read(&mut b_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                a.write_all(&b_buf[..n]).await?;
                from_b += n as u64;
            }

            _ = idle(idle_timeout) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"));
            }
        }
    }

    Ok((from_a, from_b))
}

// Recreated on every loop iteration, so any traffic resets the idle window.
// Never resolves when no timeout is configured.
async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Drive one relay session to completion: copy until either side closes or
/// errors, or cancellation fires, then close both ends. I/O errors end the
/// session and go no further.
pub(crate) async fn run_session<L, R>(
    mut local: L,
    mut channel: R,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
    mut cancel: broadcast::Receiver<()>,
) where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = Uuid::new_v4();
    debug!("Relay session {} started", session_id);

    let result = tokio::select! {
        result = copy_until_closed(&mut local, &mut channel, chunk_size, idle_timeout) => result,
        _ = cancel.recv() => {
            debug!("Relay session {} cancelled", session_id);
            Ok((0, 0))
        }
    };

    let _ = local.shutdown().await;
    let _ = channel.shutdown().await;

    match result {
        Ok((from_local, from_channel)) => debug!(
            "Relay session {} closed: {} bytes from local, {} bytes from channel",
            session_id, from_local, from_channel
        ),
        Err(e) => debug!("Relay session {} ended: {}", session_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_round_trip_both_directions() {
        let (mut a, mut a_peer) = duplex(64);
        let (mut b, mut b_peer) = duplex(64);

        let relay = tokio::spawn(async move {
            copy_until_closed(&mut a, &mut b, DEFAULT_CHUNK_SIZE, None).await
        });

        a_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_peer.write_all(b"pong").await.unwrap();
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(a_peer);
        let (from_a, from_b) = relay.await.unwrap().unwrap();
        assert_eq!(from_a, 4);
        assert_eq!(from_b, 4);
    }

    #[tokio::test]
    async fn test_payload_larger_than_chunk() {
        let (mut a, mut a_peer) = duplex(16 * 1024);
        let (mut b, mut b_peer) = duplex(16 * 1024);

        let relay =
            tokio::spawn(async move { copy_until_closed(&mut a, &mut b, 512, None).await });

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        a_peer.write_all(&payload).await.unwrap();
        drop(a_peer);

        let mut received = vec![0u8; payload.len()];
        b_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        let (from_a, _) = relay.await.unwrap().unwrap();
        assert_eq!(from_a, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_eof_from_remote_side_ends_loop() {
        let (mut a, _a_peer) = duplex(64);
        let (mut b, b_peer) = duplex(64);

        drop(b_peer);
        let result = copy_until_closed(&mut a, &mut b, DEFAULT_CHUNK_SIZE, None).await;
        assert_eq!(result.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_idle_timeout_fires_without_traffic() {
        let (mut a, _a_peer) = duplex(64);
        let (mut b, _b_peer) = duplex(64);

        let err = copy_until_closed(
            &mut a,
            &mut b,
            DEFAULT_CHUNK_SIZE,
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_traffic_resets_idle_window() {
        let (mut a, mut a_peer) = duplex(64);
        let (mut b, mut b_peer) = duplex(64);

        let relay = tokio::spawn(async move {
            copy_until_closed(&mut a, &mut b, DEFAULT_CHUNK_SIZE, Some(Duration::from_millis(200)))
                .await
        });

        // Keep the session busy for longer than the idle window.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            a_peer.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            b_peer.read_exact(&mut buf).await.unwrap();
        }

        drop(a_peer);
        let (from_a, _) = relay.await.unwrap().unwrap();
        assert_eq!(from_a, 4);
    }
}
