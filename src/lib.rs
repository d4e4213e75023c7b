//! OxideSupport - remote support sessions over SSH tunnels
//!
//! A [`SupportSession`] connects to an SSH server described by a
//! [`ConnectionProfile`], opens a forward or reverse tunnel for the local
//! support port, optionally supervises a companion process bound to that
//! port and runs [`SupportExtender`] hooks around the lifecycle.

pub mod config;
pub mod error;
pub mod forwarding;
pub mod logging;
pub mod ssh;
pub mod support;

pub use config::{load_profiles, ConnectionProfile, ProfileError, TunnelDirection};
pub use error::FailureKind;
pub use logging::{init_logging, init_profile_logging, LogGuard};
pub use ssh::{HostIdentity, KnownHostsStore, SshError, SshTransport, Transport};
pub use support::{
    NoopExtender, SessionContext, SessionState, SupportError, SupportExtender, SupportSession,
};
