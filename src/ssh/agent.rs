//! SSH Agent authentication
//!
//! Delegates signing of the server challenge to the system agent:
//! `SSH_AUTH_SOCK` on Unix, the OpenSSH named pipe on Windows.
//!
//! # The `AgentSigner` workaround
//!
//! russh 0.54's `impl Signer for AgentClient` returns an RPITIT future that
//! borrows the `PublicKey` of the sign request across `.await`, and the
//! compiler cannot prove that future `Send` (rust-lang/rust#100013).
//! `AgentSigner` clones the key before the async block so the future only
//! captures owned values.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Send-safe [`Signer`] over an [`AgentClient`]
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connection to the system SSH agent
pub struct SshAgentClient {
    agent: DynAgent,
}

impl SshAgentClient {
    pub async fn connect() -> Result<Self, SshError> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SshError::AgentNotAvailable(format!(
                    "{}. Make sure SSH_AUTH_SOCK is set and ssh-agent is running",
                    e
                ))
            })?;
            debug!("Connected to SSH Agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    SshError::AgentNotAvailable(format!(
                        "{}. Make sure the OpenSSH Authentication Agent service is running",
                        e
                    ))
                })?;
            debug!("Connected to SSH Agent via named pipe");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SshError::AgentNotAvailable(
                "SSH Agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Try every agent key in turn.
    ///
    /// `Ok(false)` means the agent works but the server accepted none of its
    /// keys, so the caller can move on to the next method.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, SshError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            debug!("SSH Agent has no keys loaded");
            return Ok(false);
        }

        debug!("SSH Agent reports {} key(s)", keys.len());

        for key in &keys {
            match handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!("SSH Agent authentication succeeded with key: {}", key.comment());
                    return Ok(true);
                }
                Ok(_) => debug!("Agent key rejected by server: {}", key.comment()),
                Err(e) => warn!("Agent signing error for key {}: {}", key.comment(), e),
            }
        }

        Ok(false)
    }
}

/// Quick check whether an agent looks reachable
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var_os("SSH_AUTH_SOCK").is_some()
    }

    #[cfg(windows)]
    {
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
