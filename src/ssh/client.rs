//! SSH transport implementation using russh

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::{compression, Channel, Preferred};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::error::SshError;
use super::handle_owner::{spawn_transport_owner, TransportController};
use super::host_key_policy::HostKeyPolicy;
use super::known_hosts::{HostIdentity, HostKeyVerification, KnownHostsStore};
use super::transport::{ConnectOptions, Transport};
use crate::forwarding::{
    handle_forwarded_connection, start_forward_tunnel, start_reverse_tunnel, ForwardTunnel,
    ReverseTunnel, ReverseTunnelRegistry, TunnelStats,
};

const COMPRESSION_ENABLED: &[compression::Name] =
    &[compression::ZLIB, compression::ZLIB_LEGACY, compression::NONE];
const COMPRESSION_DISABLED: &[compression::Name] = &[compression::NONE];

/// Keys tried when default key search is enabled, in order
const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Production [`Transport`] over russh
pub struct SshTransport {
    /// Transport ID for logging
    id: String,
    controller: Option<TransportController>,
    forward_tunnels: Vec<ForwardTunnel>,
    reverse_tunnels: Vec<ReverseTunnel>,
    reverse_registry: Arc<ReverseTunnelRegistry>,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SshTransport {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            controller: None,
            forward_tunnels: Vec::new(),
            reverse_tunnels: Vec::new(),
            reverse_registry: Arc::new(ReverseTunnelRegistry::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Statistics of every open tunnel
    pub fn tunnel_stats(&self) -> Vec<TunnelStats> {
        self.forward_tunnels
            .iter()
            .map(ForwardTunnel::stats)
            .chain(self.reverse_tunnels.iter().map(ReverseTunnel::stats))
            .collect()
    }

    fn live_controller(&self) -> Result<TransportController, SshError> {
        self.controller
            .as_ref()
            .filter(|c| c.is_connected())
            .cloned()
            .ok_or(SshError::NotConnected)
    }

    async fn open_handle(
        &self,
        options: &ConnectOptions,
        policy: Arc<dyn HostKeyPolicy>,
    ) -> Result<Handle<ClientHandler>, SshError> {
        let known_hosts = Arc::new(KnownHostsStore::open(
            options.host_key_store_path.as_deref(),
        )?);

        if let Some(path) = &options.client_key_path {
            tokio::fs::File::open(path)
                .await
                .map_err(|e| SshError::KeyFile(format!("{}: {}", path.display(), e)))?;
        }

        let addr = format!("{}:{}", options.host, options.port);
        info!("Connecting to SSH server at {}", addr);

        // Only the TCP connect is bounded: the handshake may wait on a host
        // key prompt.
        let stream = tokio::time::timeout(
            options.timeout,
            TcpStream::connect((options.host.as_str(), options.port)),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Connecting to {} took longer than {:.1}s",
                addr,
                options.timeout.as_secs_f64()
            ))
        })?
        .map_err(|e| SshError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            preferred: Preferred {
                compression: Cow::Borrowed(if options.compression {
                    COMPRESSION_ENABLED
                } else {
                    COMPRESSION_DISABLED
                }),
                ..Preferred::default()
            },
            ..Default::default()
        };

        let handler = ClientHandler {
            host: options.host.clone(),
            port: options.port,
            known_hosts,
            policy,
            reverse_tunnels: self.reverse_registry.clone(),
        };

        let handle = client::connect_stream(Arc::new(ssh_config), stream, handler).await?;
        debug!("SSH handshake completed with {}", addr);
        Ok(handle)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &mut self,
        options: &ConnectOptions,
        policy: Arc<dyn HostKeyPolicy>,
    ) -> Result<(), SshError> {
        if let Some(controller) = &self.controller {
            if controller.is_connected() {
                return Err(SshError::AlreadyConnected);
            }
            debug!("Discarding dead handle for transport {}", self.id);
            self.disconnect().await;
        }

        let mut handle = self.open_handle(options, policy).await?;

        let username = options.username.clone().unwrap_or_else(whoami::username);
        if let Err(e) = authenticate(&mut handle, &username, options).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(e);
        }

        info!(
            "SSH authentication successful for {}@{}:{}",
            username, options.host, options.port
        );
        self.controller = Some(spawn_transport_owner(handle, self.id.clone()));
        Ok(())
    }

    async fn create_forward_tunnel(
        &mut self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), SshError> {
        let controller = self.live_controller()?;
        if self
            .forward_tunnels
            .iter()
            .any(|t| t.local_port == local_port && t.is_running())
        {
            return Err(SshError::InvalidOperation(format!(
                "a forward tunnel already listens on port {}",
                local_port
            )));
        }

        let tunnel = start_forward_tunnel(controller, local_port, remote_port).await?;
        self.forward_tunnels.push(tunnel);
        Ok(())
    }

    async fn create_reverse_tunnel(&mut self, local_port: u16) -> Result<u16, SshError> {
        let controller = self.live_controller()?;
        let tunnel =
            start_reverse_tunnel(controller, self.reverse_registry.clone(), local_port).await?;
        let bound_port = tunnel.bound_port;
        self.reverse_tunnels.push(tunnel);
        Ok(bound_port)
    }

    async fn close_tunnels(&mut self) {
        for mut tunnel in self.forward_tunnels.drain(..) {
            tunnel.stop().await;
        }
        for mut tunnel in self.reverse_tunnels.drain(..) {
            tunnel.stop().await;
        }
        self.reverse_registry.clear();
    }

    fn is_connected(&self) -> bool {
        self.controller.as_ref().is_some_and(|c| c.is_connected())
    }

    async fn disconnect(&mut self) {
        // Closing the connection ends every bridged channel, no drain wait
        for mut tunnel in self.forward_tunnels.drain(..) {
            tunnel.halt().await;
        }
        for mut tunnel in self.reverse_tunnels.drain(..) {
            tunnel.halt().await;
        }
        self.reverse_registry.clear();

        if let Some(controller) = self.controller.take() {
            info!("Disconnecting transport {}", self.id);
            controller.disconnect().await;
        }
    }
}

/// Try every configured method in order: key file, agent, default keys,
/// password.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    options: &ConnectOptions,
) -> Result<(), SshError> {
    let mut tried: Vec<String> = Vec::new();
    let passphrase = options.password.as_deref();

    if let Some(path) = &options.client_key_path {
        tried.push(format!("key {}", path.display()));
        let key = load_client_key(path, passphrase)?;
        if try_public_key(handle, username, key).await? {
            return Ok(());
        }
    }

    if options.allow_agent {
        tried.push("agent".to_string());
        match SshAgentClient::connect().await {
            Ok(mut agent) => match agent.authenticate(handle, username).await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("No agent key accepted"),
                Err(e) => warn!("SSH Agent authentication failed: {}", e),
            },
            Err(e) => warn!("{}", e),
        }
    }

    if options.search_default_keys {
        for path in default_key_paths() {
            if !path.is_file() {
                continue;
            }
            tried.push(format!("key {}", path.display()));
            match load_client_key(&path, passphrase) {
                Ok(key) => {
                    if try_public_key(handle, username, key).await? {
                        return Ok(());
                    }
                }
                Err(e) => debug!("Skipping default key: {}", e),
            }
        }
    }

    if let Some(password) = &options.password {
        tried.push("password".to_string());
        if handle
            .authenticate_password(username, password)
            .await?
            .success()
        {
            return Ok(());
        }
    }

    Err(SshError::AuthenticationFailed(if tried.is_empty() {
        "no authentication method configured".to_string()
    } else {
        format!("server rejected {} (tried {})", username, tried.join(", "))
    }))
}

async fn try_public_key(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    key: PrivateKey,
) -> Result<bool, SshError> {
    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    let result = handle
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await?;
    Ok(result.success())
}

fn load_client_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, SshError> {
    match russh::keys::load_secret_key(path, passphrase) {
        Ok(key) => Ok(key),
        Err(russh::keys::Error::KeyIsEncrypted) => {
            Err(SshError::PasswordRequired(path.display().to_string()))
        }
        Err(e) => Err(SshError::KeyFile(format!("{}: {}", path.display(), e))),
    }
}

fn default_key_paths() -> Vec<PathBuf> {
    let Some(ssh_dir) = dirs::home_dir().map(|h| h.join(".ssh")) else {
        return Vec::new();
    };
    DEFAULT_KEY_NAMES.iter().map(|name| ssh_dir.join(name)).collect()
}

/// russh callbacks for one transport
///
/// - host key verification against the transport's [`KnownHostsStore`],
///   falling back to the [`HostKeyPolicy`] for unknown hosts
/// - `forwarded-tcpip` channels of reverse tunnels
pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Arc<KnownHostsStore>,
    policy: Arc<dyn HostKeyPolicy>,
    reverse_tunnels: Arc<ReverseTunnelRegistry>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let identity = HostIdentity::from_public_key(&self.host, self.port, server_public_key);

        match self.known_hosts.verify(&identity) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}", identity.display_host());
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    identity.display_host(),
                    expected_fingerprint,
                    actual_fingerprint
                );
                Err(SshError::HostKeyMismatch {
                    host: identity.display_host(),
                    expected: expected_fingerprint,
                    actual: actual_fingerprint,
                })
            }
            HostKeyVerification::Unknown => {
                // Prompts may block on the user
                let policy = self.policy.clone();
                let store = self.known_hosts.clone();
                let candidate = identity.clone();
                let decision =
                    tokio::task::spawn_blocking(move || policy.decide(&candidate, &store))
                        .await
                        .map_err(|e| {
                            SshError::ProtocolError(format!("Host key policy failed: {}", e))
                        })??;
                decision.into_result(&identity)?;
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let registry = self.reverse_tunnels.clone();
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();

        // Never block the SSH event loop with the copy
        tokio::spawn(async move {
            if let Err(e) = handle_forwarded_connection(
                &registry,
                channel,
                &connected_address,
                connected_port,
                &originator_address,
                originator_port,
            )
            .await
            {
                warn!(
                    "Failed to handle forwarded connection {}:{}: {}",
                    connected_address, connected_port, e
                );
            }
        });

        Ok(())
    }
}
