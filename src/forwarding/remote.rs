//! Reverse tunnel
//!
//! Asks the server to listen on a port of its choosing (`tcpip-forward` to
//! port 0) and carries connections arriving there back to
//! `localhost:local_port`.
//!
//! The server announces each connection by opening a `forwarded-tcpip`
//! channel, which reaches [`crate::ssh::ClientHandler`]. The handler finds
//! the local target in the [`ReverseTunnelRegistry`] owned by the same
//! transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{bridge_channel, wait_for_idle, TunnelCounters, TunnelStats};
use crate::config::TunnelDirection;
use crate::ssh::{SshError, TransportController};

/// Address the server-side listener binds to
pub const REVERSE_BIND_ADDRESS: &str = "localhost";

/// Local host reverse tunnel connections are delivered to
const LOCAL_TARGET_HOST: &str = "localhost";

/// Where connections arriving on a server port are delivered
#[derive(Debug, Clone)]
pub struct ReverseTarget {
    pub local_host: String,
    pub local_port: u16,
    pub counters: Arc<TunnelCounters>,
}

/// Bound server port -> local target, one registry per transport
#[derive(Debug, Default)]
pub struct ReverseTunnelRegistry {
    targets: RwLock<HashMap<u16, ReverseTarget>>,
}

impl ReverseTunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bound_port: u16, local_host: &str, local_port: u16) -> Arc<TunnelCounters> {
        let counters = Arc::new(TunnelCounters::new());
        self.targets.write().insert(
            bound_port,
            ReverseTarget {
                local_host: local_host.to_string(),
                local_port,
                counters: counters.clone(),
            },
        );
        debug!(
            "Registered reverse tunnel: server port {} -> {}:{}",
            bound_port, local_host, local_port
        );
        counters
    }

    pub fn unregister(&self, bound_port: u16) {
        if self.targets.write().remove(&bound_port).is_some() {
            debug!("Unregistered reverse tunnel on server port {}", bound_port);
        }
    }

    pub fn lookup(&self, bound_port: u16) -> Option<ReverseTarget> {
        self.targets.read().get(&bound_port).cloned()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    pub fn clear(&self) {
        self.targets.write().clear();
    }
}

/// A running reverse tunnel
pub struct ReverseTunnel {
    pub local_port: u16,
    /// Port allocated by the server (the access code)
    pub bound_port: u16,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    controller: TransportController,
    registry: Arc<ReverseTunnelRegistry>,
    counters: Arc<TunnelCounters>,
}

impl ReverseTunnel {
    /// Cancel the server listener and wait for open connections to drain
    pub async fn stop(&mut self) {
        if self.halt().await {
            wait_for_idle(&self.counters, &format!("server port {}", self.bound_port)).await;
        }
    }

    /// Cancel the server listener without waiting for open connections.
    /// Returns whether the tunnel was still running.
    pub async fn halt(&mut self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            self.registry.unregister(self.bound_port);
            return false;
        }
        info!("Stopping reverse tunnel on server port {}", self.bound_port);

        if let Err(e) = self
            .controller
            .cancel_tcpip_forward(REVERSE_BIND_ADDRESS, u32::from(self.bound_port))
            .await
        {
            warn!("Failed to cancel reverse tunnel: {}", e);
        }

        self.registry.unregister(self.bound_port);
        let _ = self.stop_tx.send(()).await;
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TunnelStats {
        self.counters
            .snapshot(TunnelDirection::Reverse, self.local_port, self.bound_port)
    }
}

/// Start a reverse tunnel on a server-allocated port
pub async fn start_reverse_tunnel(
    controller: TransportController,
    registry: Arc<ReverseTunnelRegistry>,
    local_port: u16,
) -> Result<ReverseTunnel, SshError> {
    info!(
        "Requesting reverse tunnel: {}:<any> -> {}:{}",
        REVERSE_BIND_ADDRESS, LOCAL_TARGET_HOST, local_port
    );

    let allocated = controller.tcpip_forward(REVERSE_BIND_ADDRESS, 0).await?;
    let bound_port = match u16::try_from(allocated) {
        Ok(port) if port != 0 => port,
        _ => {
            let _ = controller
                .cancel_tcpip_forward(REVERSE_BIND_ADDRESS, allocated)
                .await;
            return Err(SshError::TunnelRejected(format!(
                "server allocated an invalid port: {}",
                allocated
            )));
        }
    };

    let counters = registry.register(bound_port, LOCAL_TARGET_HOST, local_port);

    info!(
        "Reverse tunnel established: server port {} -> {}:{}",
        bound_port, LOCAL_TARGET_HOST, local_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let mut disconnect_rx = controller.subscribe_disconnect();
    let running_clone = running.clone();
    let registry_clone = registry.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!("Reverse tunnel monitor: stop requested");
            }
            _ = disconnect_rx.recv() => {
                info!("Reverse tunnel stopped: SSH disconnected");
            }
        }
        running_clone.store(false, Ordering::SeqCst);
        registry_clone.unregister(bound_port);
    });

    Ok(ReverseTunnel {
        local_port,
        bound_port,
        running,
        stop_tx,
        controller,
        registry,
        counters,
    })
}

/// Deliver one `forwarded-tcpip` channel to its local target
pub async fn handle_forwarded_connection(
    registry: &ReverseTunnelRegistry,
    channel: Channel<Msg>,
    connected_address: &str,
    connected_port: u32,
    originator_address: &str,
    originator_port: u32,
) -> Result<(), SshError> {
    debug!(
        "Handling forwarded connection: {}:{} from {}:{}",
        connected_address, connected_port, originator_address, originator_port
    );

    let target = u16::try_from(connected_port)
        .ok()
        .and_then(|port| registry.lookup(port));
    let Some(target) = target else {
        let _ = channel.close().await;
        return Err(SshError::TunnelRejected(format!(
            "no reverse tunnel registered for {}:{}",
            connected_address, connected_port
        )));
    };

    let stream = match TcpStream::connect((target.local_host.as_str(), target.local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Failed to connect to local target {}:{}: {}",
                target.local_host, target.local_port, e
            );
            let _ = channel.close().await;
            return Err(SshError::IoError(e));
        }
    };

    bridge_channel(channel, stream, &target.counters).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::TunnelCommand;

    #[test]
    fn test_registry() {
        let registry = ReverseTunnelRegistry::new();
        registry.register(40001, "localhost", 5900);
        assert_eq!(registry.len(), 1);

        let target = registry.lookup(40001).unwrap();
        assert_eq!(target.local_host, "localhost");
        assert_eq!(target.local_port, 5900);
        assert!(registry.lookup(40002).is_none());

        registry.unregister(40001);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reverse_tunnel_registers_allocated_port() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = TransportController::new(cmd_tx);
        let registry = Arc::new(ReverseTunnelRegistry::new());

        let server = tokio::spawn(async move {
            match cmd_rx.recv().await {
                Some(TunnelCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    assert_eq!(address, REVERSE_BIND_ADDRESS);
                    assert_eq!(port, 0);
                    let _ = reply_tx.send(Ok(54321));
                }
                _ => panic!("expected tcpip-forward"),
            }
            match cmd_rx.recv().await {
                Some(TunnelCommand::CancelTcpipForward { port, reply_tx, .. }) => {
                    assert_eq!(port, 54321);
                    let _ = reply_tx.send(Ok(()));
                }
                _ => panic!("expected cancel-tcpip-forward"),
            }
        });

        let mut tunnel = start_reverse_tunnel(controller, registry.clone(), 5900)
            .await
            .unwrap();
        assert_eq!(tunnel.bound_port, 54321);
        assert_eq!(registry.lookup(54321).unwrap().local_port, 5900);

        tunnel.stop().await;
        assert!(registry.lookup(54321).is_none());
        assert!(!tunnel.is_running());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reverse_tunnel_refused() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = TransportController::new(cmd_tx);
        let registry = Arc::new(ReverseTunnelRegistry::new());

        tokio::spawn(async move {
            if let Some(TunnelCommand::TcpipForward { reply_tx, .. }) = cmd_rx.recv().await {
                let _ = reply_tx.send(Err(russh::Error::RequestDenied));
            }
        });

        let result = start_reverse_tunnel(controller, registry.clone(), 5900).await;
        assert!(matches!(result, Err(SshError::TunnelRejected(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_halt_does_not_wait_for_open_connections() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = TransportController::new(cmd_tx);
        let registry = Arc::new(ReverseTunnelRegistry::new());

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    TunnelCommand::TcpipForward { reply_tx, .. } => {
                        let _ = reply_tx.send(Ok(40001));
                    }
                    TunnelCommand::CancelTcpipForward { reply_tx, .. } => {
                        let _ = reply_tx.send(Ok(()));
                    }
                    _ => {}
                }
            }
        });

        let mut tunnel = start_reverse_tunnel(controller, registry.clone(), 5900)
            .await
            .unwrap();
        tunnel.counters.connection_opened();

        let halted = tokio::time::timeout(std::time::Duration::from_secs(1), tunnel.halt())
            .await
            .unwrap();
        assert!(halted);
        assert!(registry.is_empty());
        assert_eq!(tunnel.stats().active_connections, 1);

        // Already stopped
        assert!(!tunnel.halt().await);
    }
}
