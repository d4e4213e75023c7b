//! Failure classification shared by every error type in the crate
//!
//! Each layer keeps its own error enum (`ProfileError`, `SshError`,
//! `SupportError`). Callers that only need to decide *what to do next*
//! ask for the [`FailureKind`] instead of matching every variant.

use serde::Serialize;

/// Caller-actionable category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or incomplete profile data
    Validation,
    /// TCP failure, refusal or timeout while connecting
    Connection,
    /// The server presented a key we have never seen and it was rejected
    HostUnknown,
    /// The server presented a key that differs from the stored one
    HostKeyChanged,
    /// Every configured credential was refused
    Authentication,
    /// The server refused a forward/reverse tunnel request
    Tunnel,
    /// A user-supplied extension hook failed
    Extension,
    /// The companion process could not be started
    Process,
    /// The operation is not valid in the current state
    InvalidOperation,
    /// Any other SSH protocol level failure
    Protocol,
}

impl FailureKind {
    /// Whether an automatic retry can reasonably succeed.
    ///
    /// A changed host key must never be retried without user action.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Connection)
    }

    /// Whether the failure concerns the identity of the remote host
    pub fn is_host_identity(self) -> bool {
        matches!(self, FailureKind::HostUnknown | FailureKind::HostKeyChanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_failures_are_retryable() {
        assert!(FailureKind::Connection.is_retryable());
        assert!(!FailureKind::HostKeyChanged.is_retryable());
        assert!(!FailureKind::Authentication.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
    }

    #[test]
    fn test_host_identity_kinds() {
        assert!(FailureKind::HostUnknown.is_host_identity());
        assert!(FailureKind::HostKeyChanged.is_host_identity());
        assert!(!FailureKind::Tunnel.is_host_identity());
    }
}
