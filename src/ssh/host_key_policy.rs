//! Host key policies
//!
//! A policy is consulted only for identities the [`KnownHostsStore`] does
//! not already trust. A changed key never reaches the policy: it is always a
//! [`SshError::HostKeyMismatch`].

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use super::error::SshError;
use super::known_hosts::{HostIdentity, HostKeyVerification, KnownHostsStore};

/// Who turned a host key down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedBy {
    Policy,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    Accept,
    Reject(RejectedBy),
}

impl HostKeyDecision {
    /// Translate a rejection into the transport error reported to callers
    pub fn into_result(self, identity: &HostIdentity) -> Result<(), SshError> {
        let host = identity.display_host();
        let key_type = identity.key_type.clone();
        let fingerprint = identity.fingerprint.clone();
        match self {
            HostKeyDecision::Accept => Ok(()),
            HostKeyDecision::Reject(RejectedBy::Policy) => Err(SshError::AutoRejectedHostKey {
                host,
                key_type,
                fingerprint,
            }),
            HostKeyDecision::Reject(RejectedBy::User) => Err(SshError::UserRejectedHostKey {
                host,
                key_type,
                fingerprint,
            }),
        }
    }
}

/// Synchronous callback asking the user whether to trust a host.
///
/// It may block (e.g. on a dialog); it is always called off the async
/// runtime.
pub type HostKeyPrompt = Arc<dyn Fn(&HostIdentity) -> bool + Send + Sync>;

/// Trust decision for an unrecognized host identity
pub trait HostKeyPolicy: Send + Sync {
    fn decide(
        &self,
        identity: &HostIdentity,
        store: &KnownHostsStore,
    ) -> Result<HostKeyDecision, SshError>;
}

/// Rejects every host that is not already in the store
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoRejectPolicy;

impl HostKeyPolicy for AutoRejectPolicy {
    fn decide(
        &self,
        identity: &HostIdentity,
        store: &KnownHostsStore,
    ) -> Result<HostKeyDecision, SshError> {
        if store.verify(identity) == HostKeyVerification::Verified {
            return Ok(HostKeyDecision::Accept);
        }
        warn!(
            "Rejecting unknown host key for {} ({} {})",
            identity.display_host(),
            identity.key_type,
            identity.fingerprint
        );
        Ok(HostKeyDecision::Reject(RejectedBy::Policy))
    }
}

/// Asks the user and persists accepted keys
pub struct PromptUserPolicy {
    prompt: HostKeyPrompt,
}

impl PromptUserPolicy {
    pub fn new(prompt: Option<HostKeyPrompt>) -> Result<Self, SshError> {
        prompt.map(|prompt| Self { prompt }).ok_or_else(|| {
            SshError::InvalidOperation("unknown hosts are allowed but no prompt was given".into())
        })
    }
}

impl fmt::Debug for PromptUserPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptUserPolicy").finish_non_exhaustive()
    }
}

impl HostKeyPolicy for PromptUserPolicy {
    fn decide(
        &self,
        identity: &HostIdentity,
        store: &KnownHostsStore,
    ) -> Result<HostKeyDecision, SshError> {
        if store.verify(identity) == HostKeyVerification::Verified {
            return Ok(HostKeyDecision::Accept);
        }

        if !(self.prompt)(identity) {
            info!("User rejected host key for {}", identity.display_host());
            return Ok(HostKeyDecision::Reject(RejectedBy::User));
        }

        store.add_identity(identity)?;
        info!(
            "User accepted host key for {} ({})",
            identity.display_host(),
            identity.fingerprint
        );
        Ok(HostKeyDecision::Accept)
    }
}
