//! SSH module - transport for support sessions
//!
//! Built on the russh library.
//!
//! # Features
//! - Host key verification against OpenSSH known_hosts files
//! - Pluggable trust decision for unknown hosts ([`HostKeyPolicy`])
//! - Key file, SSH agent, default key and password authentication
//! - Forward and reverse tunnels over one connection

mod agent;
mod client;
mod error;
mod handle_owner;
pub mod host_key_policy;
pub mod known_hosts;
mod transport;

pub use agent::{is_agent_available, SshAgentClient};
pub use client::{ClientHandler, SshTransport};
pub use error::SshError;
pub use handle_owner::{spawn_transport_owner, TransportController, TunnelCommand};
pub use host_key_policy::{
    AutoRejectPolicy, HostKeyDecision, HostKeyPolicy, HostKeyPrompt, PromptUserPolicy, RejectedBy,
};
pub use known_hosts::{HostIdentity, HostKeyVerification, KnownHostsStore};
pub use transport::{ConnectOptions, Transport};
