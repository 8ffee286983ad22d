// dbtunnel - Forwarding Engine
// Accepts local connections and pipes each one through a direct-tcpip channel

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::tunnel::ClientHandler;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Counters for the connections served by one tunnel
#[derive(Debug, Default)]
pub struct ForwardStats {
    active: AtomicUsize,
    total: AtomicU64,
    failed: AtomicU64,
    bytes_to_remote: AtomicU64,
    bytes_from_remote: AtomicU64,
}

impl ForwardStats {
    /// Connections currently being forwarded
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Connections that got a channel since the tunnel started
    pub fn total_connections(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Connections closed because the channel could not be opened
    pub fn failed_channels(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn bytes_to_remote(&self) -> u64 {
        self.bytes_to_remote.load(Ordering::Relaxed)
    }

    pub fn bytes_from_remote(&self) -> u64 {
        self.bytes_from_remote.load(Ordering::Relaxed)
    }

    fn open(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        ActiveGuard(self.clone())
    }
}

/// Decrements the active count when a connection task ends, however it ends
struct ActiveGuard(Arc<ForwardStats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Where forwarded connections go, as seen from the SSH server
#[derive(Debug, Clone)]
pub(crate) struct ForwardTarget {
    pub host: String,
    pub port: u16,
}

/// Accept local connections until cancelled.
///
/// Every accepted connection gets its own task, tracked by `tracker`, so stop
/// can wait for them.
pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    session: Arc<Handle<ClientHandler>>,
    target: ForwardTarget,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<ForwardStats>,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    info!(
        "Forwarding {} -> {}:{}",
        local, target.host, target.port
    );

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("Accepted connection from {}", peer_addr);
                tracker.spawn(handle_forward_connection(
                    stream,
                    peer_addr,
                    session.clone(),
                    target.clone(),
                    cancel.clone(),
                    stats.clone(),
                ));
            }
            Err(e) => {
                warn!("Failed to accept connection on {}: {}", local, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }

    // Listener is dropped here, closing the local port
    info!("Stopped accepting connections on {}", local);
}

/// Forward a single local connection over a fresh channel
async fn handle_forward_connection(
    mut tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    session: Arc<Handle<ClientHandler>>,
    target: ForwardTarget,
    cancel: CancellationToken,
    stats: Arc<ForwardStats>,
) {
    let _ = tcp_stream.set_nodelay(true);

    let open = session.channel_open_direct_tcpip(
        target.host.clone(),
        u32::from(target.port),
        peer_addr.ip().to_string(),
        u32::from(peer_addr.port()),
    );
    let channel = tokio::select! {
        _ = cancel.cancelled() => return,
        channel = open => channel,
    };

    let channel = match channel {
        Ok(channel) => channel,
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Failed to open channel to {}:{} for {}: {}",
                target.host, target.port, peer_addr, e
            );
            // Dropping the stream closes this local connection only
            return;
        }
    };

    let _active = stats.open();
    let channel_stream = channel.into_stream();
    let (mut channel_reader, mut channel_writer) = tokio::io::split(channel_stream);
    let (mut tcp_reader, mut tcp_writer) = tcp_stream.split();

    // The connection ends as soon as either direction is done; both ends are
    // closed when the task returns
    tokio::select! {
        biased;
        result = pump(&mut tcp_reader, &mut channel_writer, &stats.bytes_to_remote) => {
            log_pump_end(peer_addr, "local", result);
        }
        result = pump(&mut channel_reader, &mut tcp_writer, &stats.bytes_from_remote) => {
            log_pump_end(peer_addr, "remote", result);
        }
        _ = cancel.cancelled() => {
            debug!("Forward connection from {} cancelled", peer_addr);
        }
    }
}

/// Copy until EOF, then shut down the writer. Bytes are counted as they are
/// written so the totals stay correct when the other direction ends first.
async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        copied += n as u64;
    }
    writer.shutdown().await?;
    Ok(copied)
}

fn log_pump_end(peer_addr: SocketAddr, side: &str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(
            "Forward connection from {} closed by {} side after {} bytes",
            peer_addr, side, bytes
        ),
        Err(e) => debug!("Forward connection from {} ended: {}", peer_addr, e),
    }
}
