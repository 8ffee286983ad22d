// Local port allocation for the tunnel listener

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tracing::debug;

use dbtunnel_common::{Error, Result};

/// The tunnel only ever listens on loopback
pub const LISTEN_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// A local port chosen before the SSH handshake.
///
/// Ephemeral ports keep their socket bound until the listener is built, so no
/// other process can take the port in between.
#[derive(Debug)]
pub enum LocalPort {
    /// Caller-requested port, bound after the handshake
    Fixed(u16),
    /// OS-assigned port, already bound
    Ephemeral(std::net::TcpListener),
}

impl LocalPort {
    pub fn port(&self) -> u16 {
        match self {
            LocalPort::Fixed(port) => *port,
            LocalPort::Ephemeral(listener) => listener
                .local_addr()
                .map(|addr| addr.port())
                .unwrap_or_default(),
        }
    }

    /// Turn the reservation into the tokio listener serving the tunnel
    pub async fn into_listener(self) -> Result<TcpListener> {
        match self {
            LocalPort::Fixed(port) => TcpListener::bind(SocketAddr::from((LISTEN_ADDR, port)))
                .await
                .map_err(|source| Error::Bind { port, source }),
            LocalPort::Ephemeral(listener) => {
                let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
                listener
                    .set_nonblocking(true)
                    .and_then(|_| TcpListener::from_std(listener))
                    .map_err(|source| Error::Bind { port, source })
            }
        }
    }
}

/// Resolve the local port: the requested one, or an ephemeral one when 0.
pub fn pick_local_port(requested: u16) -> Result<LocalPort> {
    if requested != 0 {
        return Ok(LocalPort::Fixed(requested));
    }

    let listener = std::net::TcpListener::bind(SocketAddr::from((LISTEN_ADDR, 0)))
        .map_err(Error::PortAllocation)?;
    let port = listener.local_addr().map_err(Error::PortAllocation)?.port();
    debug!("Allocated ephemeral local port {}", port);
    Ok(LocalPort::Ephemeral(listener))
}
