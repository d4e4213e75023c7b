//! SSH Error types

use thiserror::Error;

use crate::error::FailureKind;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(
        "Host key for {host} has changed! Expected {expected}, got {actual}. \
         This could indicate a man-in-the-middle attack"
    )]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown host {host} rejected ({key_type} {fingerprint})")]
    AutoRejectedHostKey {
        host: String,
        key_type: String,
        fingerprint: String,
    },

    #[error("Host key for {host} rejected by user ({key_type} {fingerprint})")]
    UserRejectedHostKey {
        host: String,
        key_type: String,
        fingerprint: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key {0} is encrypted and no password was given")]
    PasswordRequired(String),

    #[error("Tunnel rejected: {0}")]
    TunnelRejected(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SshError::NotConnected
            | SshError::AlreadyConnected
            | SshError::InvalidOperation(_) => FailureKind::InvalidOperation,
            SshError::KeyFile(_) => FailureKind::Validation,
            SshError::ConnectionFailed(_)
            | SshError::Timeout(_)
            | SshError::IoError(_)
            | SshError::Disconnected => FailureKind::Connection,
            SshError::HostKeyMismatch { .. } => FailureKind::HostKeyChanged,
            SshError::AutoRejectedHostKey { .. } | SshError::UserRejectedHostKey { .. } => {
                FailureKind::HostUnknown
            }
            SshError::AuthenticationFailed(_)
            | SshError::PasswordRequired(_)
            | SshError::AgentNotAvailable(_)
            | SshError::AgentError(_) => FailureKind::Authentication,
            SshError::TunnelRejected(_) => FailureKind::Tunnel,
            SshError::ProtocolError(_) => FailureKind::Protocol,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::ConnectionFailed(e.to_string()),
            russh::Error::ConnectionTimeout => {
                SshError::Timeout("Connection timed out".to_string())
            }
            russh::Error::NotAuthenticated => {
                SshError::AuthenticationFailed("Not authenticated".to_string())
            }
            russh::Error::Disconnect => SshError::Disconnected,
            russh::Error::Keys(e) => SshError::from(e),
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyFile(err.to_string())
    }
}
