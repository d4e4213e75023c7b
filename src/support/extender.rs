//! Extension hooks
//!
//! A [`SupportExtender`] observes a session at three points of its
//! lifecycle. Every hook defaults to doing nothing.
//!
//! | Hook | Runs | On error |
//! |---|---|---|
//! | `on_pre_connect` | before the transport connects, inline | `connect` fails |
//! | `on_session_start` | on a background task once the tunnel is up | logged |
//! | `on_session_stop` | inside `stop_session`, before disconnecting | logged |
//!
//! `stop_session` waits for `on_session_start` to finish without a timeout,
//! so implementations must not block indefinitely.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::HookError;
use super::session::SessionState;
use crate::config::ConnectionProfile;

/// Snapshot of a session handed to hooks
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub profile: Arc<ConnectionProfile>,
    pub state: SessionState,
    /// Access code once a tunnel is up
    pub remote_port: Option<u16>,
    pub companion_pid: Option<u32>,
}

#[async_trait]
pub trait SupportExtender: Send + Sync {
    async fn on_pre_connect(&self, _ctx: &SessionContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_session_start(&self, _ctx: &SessionContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_session_stop(&self, _ctx: &SessionContext) -> Result<(), HookError> {
        Ok(())
    }
}

/// Extender with no behavior
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExtender;

impl SupportExtender for NoopExtender {}
