//! Port Forwarding Module
//!
//! The two tunnel shapes a support session needs:
//! - forward: `127.0.0.1:local` -> `localhost:remote` on the server
//!   (the consumer joins a pre-agreed port)
//! - reverse: server-allocated port -> `localhost:local`
//!   (the provider exposes its local service)

mod local;
mod remote;

use std::sync::atomic::{AtomicU64, Ordering};

use russh::client::Msg;
use russh::Channel;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::TunnelDirection;

pub use local::{start_forward_tunnel, ForwardTunnel};
pub use remote::{
    handle_forwarded_connection, start_reverse_tunnel, ReverseTarget, ReverseTunnel,
    ReverseTunnelRegistry, REVERSE_BIND_ADDRESS,
};

/// Snapshot of one tunnel's statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStats {
    pub direction: TunnelDirection,
    pub local_port: u16,
    pub remote_port: u16,
    /// Total connections handled
    pub connection_count: u64,
    /// Connections open right now
    pub active_connections: u64,
    /// Bytes from the local side into the tunnel
    pub bytes_sent: u64,
    /// Bytes from the tunnel to the local side
    pub bytes_received: u64,
}

/// Lock-free counters updated from connection tasks
#[derive(Debug, Default)]
pub struct TunnelCounters {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TunnelCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection_opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, sent: u64, received: u64) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, direction: TunnelDirection, local_port: u16, remote_port: u16) -> TunnelStats {
        TunnelStats {
            direction,
            local_port,
            remote_port,
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Pump bytes between a local socket and an SSH channel until either side
/// closes.
async fn bridge_channel(
    channel: Channel<Msg>,
    mut local: TcpStream,
    counters: &TunnelCounters,
) -> std::io::Result<()> {
    // Disable Nagle's algorithm for interactive traffic (VNC)
    if let Err(e) = local.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let mut remote = Box::pin(channel.into_stream());
    counters.connection_opened();

    let result = tokio::io::copy_bidirectional(&mut local, &mut remote).await;
    let _ = remote.shutdown().await;

    match result {
        Ok((sent, received)) => {
            counters.connection_closed(sent, received);
            debug!(
                "Tunnel connection closed ({} bytes sent, {} bytes received)",
                sent, received
            );
            Ok(())
        }
        Err(e) => {
            counters.connection_closed(0, 0);
            Err(e)
        }
    }
}

/// Wait (bounded) for the connections of a stopped tunnel to finish
async fn wait_for_idle(counters: &TunnelCounters, what: &str) {
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(5);
    while counters.active_connections() > 0 {
        if start.elapsed() > timeout {
            warn!(
                "Timeout waiting for {} active connections to close on {}",
                counters.active_connections(),
                what
            );
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
