//! Transport abstraction used by support sessions
//!
//! [`Transport`] is the seam between the session state machine and the SSH
//! library. [`super::SshTransport`] is the production implementation; tests
//! plug in fakes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::SshError;
use super::host_key_policy::HostKeyPolicy;
use crate::config::ConnectionProfile;

/// Everything needed to open and authenticate one connection
#[derive(Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Login name, the local user when unset
    pub username: Option<String>,
    /// Writable known_hosts file for accepted keys
    pub host_key_store_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Password, also used as passphrase for an encrypted client key
    pub password: Option<String>,
    pub timeout: Duration,
    pub compression: bool,
    pub allow_agent: bool,
    pub search_default_keys: bool,
}

impl ConnectOptions {
    pub fn from_profile(profile: &ConnectionProfile, password: Option<String>) -> Self {
        let timeout = Duration::try_from_secs_f64(profile.connect_timeout_seconds())
            .unwrap_or(Duration::MAX);
        Self {
            host: profile.server_host.clone(),
            port: profile.server_port(),
            username: profile.username.clone(),
            host_key_store_path: profile.host_key_store_path.clone(),
            client_key_path: profile.client_key_path.clone(),
            password,
            timeout,
            compression: profile.enable_compression,
            allow_agent: profile.allow_agent_auth,
            search_default_keys: profile.search_default_keys,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("host_key_store_path", &self.host_key_store_path)
            .field("client_key_path", &self.client_key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("compression", &self.compression)
            .field("allow_agent", &self.allow_agent)
            .field("search_default_keys", &self.search_default_keys)
            .finish()
    }
}

/// One authenticated connection and the tunnels running over it.
///
/// Lifecycle: unconnected -> connected -> disconnected. A disconnected
/// transport may be connected again; the old handle is discarded.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate. Fails with [`SshError::AlreadyConnected`]
    /// on a live connection.
    async fn connect(
        &mut self,
        options: &ConnectOptions,
        policy: Arc<dyn HostKeyPolicy>,
    ) -> Result<(), SshError>;

    /// Forward `local_port` on this machine to `remote_port` on the server
    async fn create_forward_tunnel(
        &mut self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), SshError>;

    /// Have the server listen on a free port of its choosing and forward it
    /// back to `local_port`. Returns the allocated port.
    async fn create_reverse_tunnel(&mut self, local_port: u16) -> Result<u16, SshError>;

    /// Tear down every tunnel but keep the connection
    async fn close_tunnels(&mut self);

    fn is_connected(&self) -> bool;

    /// Close tunnels and the connection. No-op when not connected.
    async fn disconnect(&mut self);
}
