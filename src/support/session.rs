//! Support session state machine
//!
//! ```text
//! Idle --connect--> Connected --start_session--> SessionActive
//!  ^                    |                             |
//!  +----stop_session----+-------------stop_session----+
//! ```
//!
//! All transitions run under one async mutex, so a second concurrent
//! `stop_session` sees the state the first one left behind.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::companion::{
    build_companion_argv, is_process_gone, CompanionProcess, ProcessSupervisor,
    TokioProcessSupervisor,
};
use super::error::SupportError;
use super::extender::{SessionContext, SupportExtender};
use crate::config::{ConnectionProfile, TunnelDirection};
use crate::ssh::{
    AutoRejectPolicy, ConnectOptions, HostIdentity, HostKeyPolicy, HostKeyPrompt,
    PromptUserPolicy, SshTransport, Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connected,
    SessionActive,
}

struct SessionInner {
    state: SessionState,
    transport: Box<dyn Transport>,
    /// Access code of the running tunnel
    remote_port: Option<u16>,
    companion: Option<Box<dyn CompanionProcess>>,
    /// Background task running `on_session_start`
    hook_task: Option<JoinHandle<()>>,
}

/// One remote-support session over one transport
pub struct SupportSession {
    id: String,
    profile: Arc<ConnectionProfile>,
    extender: Arc<dyn SupportExtender>,
    supervisor: Arc<dyn ProcessSupervisor>,
    host_key_prompt: Option<HostKeyPrompt>,
    inner: Mutex<SessionInner>,
}

impl SupportSession {
    /// Create an idle session. The profile is runtime-validated (defaults
    /// filled, paths expanded) before it is accepted.
    pub fn new(
        mut profile: ConnectionProfile,
        extender: Arc<dyn SupportExtender>,
    ) -> Result<Self, SupportError> {
        profile.runtime_validate(true)?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            profile: Arc::new(profile),
            extender,
            supervisor: Arc::new(TokioProcessSupervisor),
            host_key_prompt: None,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                transport: Box::new(SshTransport::new()),
                remote_port: None,
                companion: None,
                hook_task: None,
            }),
        })
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.inner.get_mut().transport = Box::new(transport);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Callback asked whether to trust a host that is not in the store.
    /// Only consulted when the profile allows unknown hosts.
    pub fn with_host_key_prompt(
        mut self,
        prompt: impl Fn(&HostIdentity) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.host_key_prompt = Some(Arc::new(prompt));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Access code of the running session, if any
    pub async fn remote_port(&self) -> Option<u16> {
        self.inner.lock().await.remote_port
    }

    fn context(&self, inner: &SessionInner) -> SessionContext {
        SessionContext {
            session_id: self.id.clone(),
            profile: self.profile.clone(),
            state: inner.state,
            remote_port: inner.remote_port,
            companion_pid: inner.companion.as_ref().and_then(|c| c.id()),
        }
    }

    fn host_key_policy(&self) -> Result<Arc<dyn HostKeyPolicy>, SupportError> {
        if self.profile.allow_unknown_host {
            Ok(Arc::new(PromptUserPolicy::new(self.host_key_prompt.clone())?))
        } else {
            Ok(Arc::new(AutoRejectPolicy))
        }
    }

    /// Run the pre-connect hook, then connect and authenticate.
    ///
    /// On failure the session stays idle.
    pub async fn connect(&self, password: Option<String>) -> Result<(), SupportError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Idle {
            return Err(SupportError::InvalidOperation(format!(
                "connect requires an idle session (current state: {:?})",
                inner.state
            )));
        }

        let ctx = self.context(&inner);
        if let Err(e) = self.extender.on_pre_connect(&ctx).await {
            error!("Pre-connect hook failed for session {}: {}", self.id, e);
            return Err(SupportError::Hook {
                hook: "on_pre_connect",
                source: e,
            });
        }

        let policy = self.host_key_policy()?;
        let options = ConnectOptions::from_profile(&self.profile, password);
        info!(
            "Session {} connecting to {}:{}",
            self.id, options.host, options.port
        );
        if let Err(e) = inner.transport.connect(&options, policy).await {
            error!("Session {} failed to connect: {}", self.id, e);
            return Err(e.into());
        }

        inner.state = SessionState::Connected;
        info!("Session {} connected", self.id);
        Ok(())
    }

    /// Open the tunnel, start the companion and fire `on_session_start`.
    ///
    /// Returns the access code: the given one for a forward tunnel, the
    /// server-allocated port for a reverse tunnel.
    pub async fn start_session(&self, access_code: Option<u16>) -> Result<u16, SupportError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return Err(SupportError::InvalidOperation(format!(
                "start_session requires a connected session (current state: {:?})",
                inner.state
            )));
        }

        let local_port = self.profile.local_support_port;
        let direction = self.profile.tunnel_direction;
        let forward_code = match direction {
            TunnelDirection::Forward => Some(access_code.ok_or(SupportError::MissingAccessCode)?),
            TunnelDirection::Reverse => None,
        };

        let companion_argv = match &self.profile.companion_executable_path {
            Some(exe) => Some(build_companion_argv(
                exe,
                self.profile.companion_args_template.as_deref(),
                local_port,
            )?),
            None => None,
        };

        let remote_port = match forward_code {
            Some(code) => {
                inner.transport.create_forward_tunnel(local_port, code).await?;
                code
            }
            None => {
                if access_code.is_some() {
                    debug!("Reverse tunnel ignores the supplied access code");
                }
                inner.transport.create_reverse_tunnel(local_port).await?
            }
        };
        info!(
            "Session {} opened {} tunnel (local {}, access code {})",
            self.id, direction, local_port, remote_port
        );

        if let (Some(exe), Some(argv)) = (&self.profile.companion_executable_path, companion_argv)
        {
            match self.spawn_companion(exe, &argv) {
                Ok(child) => inner.companion = Some(child),
                Err(e) => {
                    inner.transport.close_tunnels().await;
                    return Err(e);
                }
            }
        }

        inner.remote_port = Some(remote_port);
        inner.state = SessionState::SessionActive;

        let extender = self.extender.clone();
        let ctx = self.context(&inner);
        inner.hook_task = Some(tokio::spawn(async move {
            if let Err(e) = extender.on_session_start(&ctx).await {
                warn!("Session start hook failed for {}: {}", ctx.session_id, e);
            }
        }));

        Ok(remote_port)
    }

    fn spawn_companion(
        &self,
        exe: &Path,
        argv: &[String],
    ) -> Result<Box<dyn CompanionProcess>, SupportError> {
        info!("Starting companion: {:?}", argv);
        self.supervisor.spawn(exe, argv).map_err(|e| {
            error!("Failed to start companion {}: {}", exe.display(), e);
            SupportError::Companion(format!("cannot start {}: {}", exe.display(), e))
        })
    }

    /// Tear the session down from any state. Never fails.
    ///
    /// Order: join the start hook, kill the companion, run
    /// `on_session_stop` (only if a session was started), disconnect.
    pub async fn stop_session(&self) {
        let mut inner = self.inner.lock().await;

        let hook_task = inner.hook_task.take();
        let companion = inner.companion.take();
        let started = hook_task.is_some() || companion.is_some();

        if let Some(task) = hook_task {
            if let Err(e) = task.await {
                error!("Session start hook of {} did not finish: {}", self.id, e);
            }
        }

        if let Some(mut child) = companion {
            match child.kill().await {
                Ok(()) => debug!("Companion of session {} stopped", self.id),
                Err(e) if is_process_gone(&e) => {
                    debug!("Companion of session {} already gone: {}", self.id, e)
                }
                Err(e) => error!("Failed to kill companion of session {}: {}", self.id, e),
            }
        }

        if started {
            let ctx = self.context(&inner);
            match AssertUnwindSafe(self.extender.on_session_stop(&ctx))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Session stop hook failed for {}: {}", self.id, e),
                Err(_) => error!("Session stop hook panicked for {}", self.id),
            }
        }

        if inner.transport.is_connected() || inner.state != SessionState::Idle {
            inner.transport.disconnect().await;
            info!("Session {} disconnected", self.id);
        }

        inner.remote_port = None;
        inner.state = SessionState::Idle;
    }
}

impl std::fmt::Debug for SupportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupportSession")
            .field("id", &self.id)
            .field("profile", &self.profile.name)
            .finish_non_exhaustive()
    }
}
