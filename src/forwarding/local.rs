//! Forward tunnel
//!
//! Listens on `127.0.0.1:local_port` and carries every accepted connection
//! through a `direct-tcpip` channel to `localhost:remote_port` on the
//! server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{bridge_channel, wait_for_idle, TunnelCounters, TunnelStats};
use crate::config::TunnelDirection;
use crate::ssh::{SshError, TransportController};

/// Host the server connects to for a forward tunnel
const FORWARD_TARGET_HOST: &str = "localhost";

/// A running forward tunnel
pub struct ForwardTunnel {
    pub local_port: u16,
    pub remote_port: u16,
    /// Actual bound address
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
    counters: Arc<TunnelCounters>,
}

impl ForwardTunnel {
    /// Stop listening and wait for open connections to drain
    pub async fn stop(&mut self) {
        self.halt().await;
        wait_for_idle(&self.counters, &self.bound_addr.to_string()).await;
    }

    /// Stop listening without waiting for open connections. Used right
    /// before the connection closes, which ends every channel anyway.
    pub async fn halt(&mut self) {
        info!("Stopping forward tunnel on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;

        // The listener is released once the accept task has returned
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TunnelStats {
        self.counters
            .snapshot(TunnelDirection::Forward, self.local_port, self.remote_port)
    }
}

/// Start a forward tunnel over `controller`
pub async fn start_forward_tunnel(
    controller: TransportController,
    local_port: u16,
    remote_port: u16,
) -> Result<ForwardTunnel, SshError> {
    let local_addr = format!("127.0.0.1:{}", local_port);
    let listener = TcpListener::bind(&local_addr)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => SshError::TunnelRejected(format!(
                "Port already in use: {}. Another application may be using this port",
                local_addr
            )),
            std::io::ErrorKind::PermissionDenied => SshError::TunnelRejected(format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges",
                local_addr
            )),
            _ => SshError::TunnelRejected(format!("Failed to bind to {}: {}", local_addr, e)),
        })?;

    let bound_addr = listener.local_addr()?;

    info!(
        "Started forward tunnel: {} -> {}:{}",
        bound_addr, FORWARD_TARGET_HOST, remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
    let counters = Arc::new(TunnelCounters::new());

    let task = tokio::spawn(accept_loop(
        listener,
        controller,
        remote_port,
        running.clone(),
        stop_rx,
        counters.clone(),
    ));

    Ok(ForwardTunnel {
        local_port,
        remote_port,
        bound_addr,
        running,
        stop_tx,
        task: Some(task),
        counters,
    })
}

async fn accept_loop(
    listener: TcpListener,
    controller: TransportController,
    remote_port: u16,
    running: Arc<AtomicBool>,
    mut stop_rx: mpsc::Receiver<()>,
    counters: Arc<TunnelCounters>,
) {
    let mut disconnect_rx = controller.subscribe_disconnect();

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                info!("Forward tunnel stopped: SSH disconnected");
                break;
            }

            // Also fires when the tunnel handle is dropped
            _ = stop_rx.recv() => {
                info!("Forward tunnel stopped by request");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        debug!("Accepted connection from {} for forward tunnel", peer_addr);

                        let controller = controller.clone();
                        let counters = counters.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward_connection(
                                &controller,
                                stream,
                                peer_addr,
                                remote_port,
                                &counters,
                            )
                            .await
                            {
                                warn!("Forward tunnel connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!("Forward tunnel task exited");
}

async fn forward_connection(
    controller: &TransportController,
    stream: TcpStream,
    peer_addr: SocketAddr,
    remote_port: u16,
    counters: &TunnelCounters,
) -> Result<(), SshError> {
    let channel = controller
        .open_direct_tcpip(
            FORWARD_TARGET_HOST,
            u32::from(remote_port),
            &peer_addr.ip().to_string(),
            u32::from(peer_addr.port()),
        )
        .await?;

    debug!(
        "Opened channel for forward to {}:{}",
        FORWARD_TARGET_HOST, remote_port
    );

    bridge_channel(channel, stream, counters).await?;
    Ok(())
}
