//! Companion process supervision
//!
//! The companion (typically a VNC server or viewer) is started once the
//! tunnel is up and is killed by the session on stop. It is never expected
//! to exit on its own.

use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use super::error::SupportError;

/// Marker replaced by the local support port in argument templates
pub const PORT_MARKER: &str = "%d";

/// Build the companion argv from a template.
///
/// Every `%d` is replaced by `local_port`, the result is split with shell
/// word rules (quotes keep spaces) and the executable becomes `argv[0]`.
pub fn build_companion_argv(
    executable: &Path,
    template: Option<&str>,
    local_port: u16,
) -> Result<Vec<String>, SupportError> {
    let mut argv = vec![executable.to_string_lossy().into_owned()];

    if let Some(template) = template {
        let expanded = template.replace(PORT_MARKER, &local_port.to_string());
        let args = shlex::split(&expanded).ok_or_else(|| {
            SupportError::Companion(format!("cannot split arguments: {}", expanded))
        })?;
        argv.extend(args);
    }

    Ok(argv)
}

/// Handle to a running companion process
#[async_trait]
pub trait CompanionProcess: Send + Sync {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    /// Terminate the process and reap it
    async fn kill(&mut self) -> io::Result<()>;
}

/// Starts companion processes
pub trait ProcessSupervisor: Send + Sync {
    /// `argv[0]` is the executable as given to the user; the process is
    /// started from `executable` with `argv[1..]` as arguments.
    fn spawn(&self, executable: &Path, argv: &[String]) -> io::Result<Box<dyn CompanionProcess>>;
}

/// Supervisor backed by `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessSupervisor;

impl ProcessSupervisor for TokioProcessSupervisor {
    fn spawn(&self, executable: &Path, argv: &[String]) -> io::Result<Box<dyn CompanionProcess>> {
        let mut command = Command::new(executable);
        command
            .args(argv.get(1..).unwrap_or_default())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Keep terminal signals aimed at the host application away from it
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        debug!(
            "Spawned companion {} (pid {:?})",
            executable.display(),
            child.id()
        );
        Ok(Box::new(TokioCompanion { child }))
    }
}

struct TokioCompanion {
    child: Child,
}

#[async_trait]
impl CompanionProcess for TokioCompanion {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Killing a child that was already reaped succeeds
    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Whether a kill error only says the process no longer exists
pub fn is_process_gone(err: &io::Error) -> bool {
    #[cfg(unix)]
    const ESRCH: i32 = 3;

    match err.kind() {
        io::ErrorKind::NotFound => true,
        #[cfg(unix)]
        _ if err.raw_os_error() == Some(ESRCH) => true,
        _ => false,
    }
}
