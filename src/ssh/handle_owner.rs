//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Tunnels and the transport
//! talk to it through a cloneable [`TransportController`] that sends
//! commands over an mpsc channel, so the handle is never shared behind a
//! lock held across `.await`.
//!
//! ```ignore
//! let controller = spawn_transport_owner(handle, transport_id);
//! let channel = controller.open_direct_tcpip("localhost", 5900, "127.0.0.1", 0).await?;
//! let bound_port = controller.tcpip_forward("localhost", 0).await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether the server closed the connection
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum TunnelCommand {
    /// Open a direct-tcpip channel (forward tunnel connection)
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request a server-side listener (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel a server-side listener
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for the Handle Owner Task.
///
/// Cloning is cheap (one `Sender`); every clone has full control over the
/// connection, so it must not leave the process.
#[derive(Clone)]
pub struct TransportController {
    cmd_tx: mpsc::Sender<TunnelCommand>,
    /// Fires once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
}

impl TransportController {
    /// Controller over a raw command channel, with no owner task attached
    pub fn new(cmd_tx: mpsc::Sender<TunnelCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receiver that gets `()` when the SSH connection closes
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(TunnelCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(tunnel_error)
    }

    /// Request a server-side listener.
    ///
    /// Returns the bound port, which is server-allocated when `port` is 0.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(TunnelCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(tunnel_error)
    }

    /// Cancel a server-side listener
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(TunnelCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(tunnel_error)
    }

    /// Ask the owner task to disconnect and wait until it is gone
    pub async fn disconnect(&self) {
        if self.cmd_tx.send(TunnelCommand::Disconnect).await.is_ok() {
            self.cmd_tx.closed().await;
        }
    }

    /// Whether the owner task (and so the connection) is still alive
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// A refused channel or forward request is a tunnel error; anything else
/// keeps its transport meaning.
fn tunnel_error(err: russh::Error) -> SshError {
    match err {
        russh::Error::Disconnect => SshError::Disconnected,
        russh::Error::IO(e) => SshError::IoError(e),
        other => SshError::TunnelRejected(other.to_string()),
    }
}

/// Spawn the Handle Owner Task, transferring ownership of `handle` to it
pub fn spawn_transport_owner(
    handle: Handle<ClientHandler>,
    transport_id: String,
) -> TransportController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<TunnelCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);

        info!("Handle owner task started for transport {}", transport_id);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("Connection closed by server for transport {}", transport_id);
                        break;
                    }
                    continue;
                }
            };

            let Some(cmd) = cmd else {
                info!("All controllers dropped for transport {}", transport_id);
                break;
            };

            match cmd {
                TunnelCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped and the server closes it
                        debug!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                TunnelCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    if let Ok(bound_port) = result {
                        if reply_tx.send(Ok(bound_port)).is_err() {
                            // Nobody will ever use this listener
                            warn!(
                                "Caller dropped after tcpip_forward succeeded. \
                                 Cancelling orphaned forward {}:{}",
                                address, bound_port
                            );
                            let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                        }
                    } else {
                        let _ = reply_tx.send(result);
                    }
                }

                TunnelCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }

                TunnelCommand::Disconnect => {
                    info!("Disconnect requested for transport {}", transport_id);
                    break;
                }
            }
        }

        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Support session closed", "en")
            .await;
        info!("Handle owner task terminated for transport {}", transport_id);
    });

    TransportController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Answer every queued command with a disconnect error
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<TunnelCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            TunnelCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            TunnelCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            TunnelCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            TunnelCommand::Disconnect => {}
        }
    }
}
