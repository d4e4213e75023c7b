//! Support session errors

use thiserror::Error;

use crate::config::ProfileError;
use crate::error::FailureKind;
use crate::ssh::SshError;

/// Error type returned by extension hooks
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum SupportError {
    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Transport(#[from] SshError),

    /// A forward tunnel needs the access code agreed with the other peer
    #[error("An access code is required to start a forward tunnel session")]
    MissingAccessCode,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Extension hook {hook} failed: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: HookError,
    },

    #[error("Companion process error: {0}")]
    Companion(String),
}

impl SupportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SupportError::Profile(e) => e.kind(),
            SupportError::Transport(e) => e.kind(),
            SupportError::MissingAccessCode => FailureKind::Validation,
            SupportError::InvalidOperation(_) => FailureKind::InvalidOperation,
            SupportError::Hook { .. } => FailureKind::Extension,
            SupportError::Companion(_) => FailureKind::Process,
        }
    }
}
