//! Session lifecycle tests against fake transport, supervisor and hooks

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use oxide_support::error::FailureKind;
use oxide_support::ssh::{ConnectOptions, HostKeyPolicy};
use oxide_support::support::{CompanionProcess, HookError, ProcessSupervisor};
use oxide_support::{
    ConnectionProfile, SessionContext, SessionState, SshError, SupportError, SupportExtender,
    SupportSession, Transport, TunnelDirection,
};

const ALLOCATED_PORT: u16 = 54321;

/// Ordered record of what every fake saw
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn position(&self, prefix: &str) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|e| e.starts_with(prefix))
            .unwrap_or_else(|| panic!("no {prefix:?} event in {events:?}"))
    }
}

struct FakeTransport {
    journal: Journal,
    connected: bool,
    fail_connect: bool,
    fail_tunnel: bool,
}

impl FakeTransport {
    fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            connected: false,
            fail_connect: false,
            fail_tunnel: false,
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &mut self,
        options: &ConnectOptions,
        _policy: Arc<dyn HostKeyPolicy>,
    ) -> Result<(), SshError> {
        if self.fail_connect {
            self.journal.push("connect failed");
            return Err(SshError::ConnectionFailed("connection refused".into()));
        }
        self.journal
            .push(format!("connect {}:{}", options.host, options.port));
        self.connected = true;
        Ok(())
    }

    async fn create_forward_tunnel(
        &mut self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), SshError> {
        if self.fail_tunnel {
            return Err(SshError::TunnelRejected("administratively prohibited".into()));
        }
        self.journal
            .push(format!("forward {} {}", local_port, remote_port));
        Ok(())
    }

    async fn create_reverse_tunnel(&mut self, local_port: u16) -> Result<u16, SshError> {
        if self.fail_tunnel {
            return Err(SshError::TunnelRejected("administratively prohibited".into()));
        }
        self.journal.push(format!("reverse {}", local_port));
        Ok(ALLOCATED_PORT)
    }

    async fn close_tunnels(&mut self) {
        self.journal.push("close_tunnels");
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.journal.push("disconnect");
            self.connected = false;
        }
    }
}

struct FakeCompanion {
    journal: Journal,
    killed: bool,
    kill_error: Option<io::ErrorKind>,
}

#[async_trait]
impl CompanionProcess for FakeCompanion {
    fn id(&self) -> Option<u32> {
        (!self.killed).then_some(4242)
    }

    async fn kill(&mut self) -> io::Result<()> {
        if let Some(kind) = self.kill_error {
            self.journal.push("kill failed");
            return Err(kind.into());
        }
        if self.killed {
            return Err(io::ErrorKind::NotFound.into());
        }
        self.killed = true;
        self.journal.push("kill");
        Ok(())
    }
}

struct FakeSupervisor {
    journal: Journal,
    fail: bool,
    kill_error: Option<io::ErrorKind>,
    spawned: Mutex<Vec<Vec<String>>>,
}

impl FakeSupervisor {
    fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fail: false,
            kill_error: None,
            spawned: Mutex::new(Vec::new()),
        }
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn spawn(&self, _executable: &Path, argv: &[String]) -> io::Result<Box<dyn CompanionProcess>> {
        if self.fail {
            return Err(io::ErrorKind::PermissionDenied.into());
        }
        self.journal.push("spawn");
        self.spawned.lock().push(argv.to_vec());
        Ok(Box::new(FakeCompanion {
            journal: self.journal.clone(),
            killed: false,
            kill_error: self.kill_error,
        }))
    }
}

#[derive(Default)]
struct RecordingExtender {
    journal: Journal,
    fail_pre_connect: bool,
    fail_start: bool,
    start_delay: Option<Duration>,
    panic_on_stop: bool,
}

#[async_trait]
impl SupportExtender for RecordingExtender {
    async fn on_pre_connect(&self, ctx: &SessionContext) -> Result<(), HookError> {
        self.journal.push(format!("pre_connect {:?}", ctx.state));
        if self.fail_pre_connect {
            return Err("maintenance window".into());
        }
        Ok(())
    }

    async fn on_session_start(&self, ctx: &SessionContext) -> Result<(), HookError> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.journal
            .push(format!("session_start {:?}", ctx.remote_port));
        if self.fail_start {
            return Err("ticket system unreachable".into());
        }
        Ok(())
    }

    async fn on_session_stop(&self, _ctx: &SessionContext) -> Result<(), HookError> {
        self.journal.push("session_stop");
        if self.panic_on_stop {
            panic!("stop hook blew up");
        }
        Ok(())
    }
}

fn profile(direction: TunnelDirection) -> ConnectionProfile {
    ConnectionProfile::new("helpdesk", "support.example.com", 5900, direction)
}

fn session_with(
    profile: ConnectionProfile,
    extender: RecordingExtender,
    supervisor: FakeSupervisor,
) -> SupportSession {
    let transport = FakeTransport::new(&extender.journal);
    SupportSession::new(profile, Arc::new(extender))
        .unwrap()
        .with_transport(transport)
        .with_supervisor(Arc::new(supervisor))
}

fn session(profile: ConnectionProfile, journal: &Journal) -> SupportSession {
    let extender = RecordingExtender {
        journal: journal.clone(),
        ..Default::default()
    };
    session_with(profile, extender, FakeSupervisor::new(journal))
}

#[tokio::test]
async fn test_reverse_session_without_companion() {
    let journal = Journal::default();
    let session = session(profile(TunnelDirection::Reverse), &journal);

    session.connect(None).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);

    let code = session.start_session(None).await.unwrap();
    assert_eq!(code, ALLOCATED_PORT);
    assert_eq!(session.state().await, SessionState::SessionActive);
    assert_eq!(session.remote_port().await, Some(ALLOCATED_PORT));

    session.stop_session().await;
    assert_eq!(session.state().await, SessionState::Idle);
    assert_eq!(session.remote_port().await, None);

    let events = journal.events();
    assert_eq!(events[0], "pre_connect Idle");
    assert_eq!(events[1], "connect support.example.com:22");
    assert_eq!(events[2], "reverse 5900");
    assert_eq!(events.last().map(String::as_str), Some("disconnect"));
    assert_eq!(journal.count("session_stop"), 1);
}

#[tokio::test]
async fn test_forward_session_echoes_access_code() {
    let journal = Journal::default();
    let session = session(profile(TunnelDirection::Forward), &journal);

    session.connect(None).await.unwrap();
    let code = session.start_session(Some(12345)).await.unwrap();
    assert_eq!(code, 12345);
    assert_eq!(journal.count("forward 5900 12345"), 1);

    session.stop_session().await;
}

#[tokio::test]
async fn test_companion_argv_gets_both_substitutions() {
    let journal = Journal::default();
    let exe = tempfile::NamedTempFile::new().unwrap();

    let mut profile = profile(TunnelDirection::Reverse);
    profile.companion_executable_path = Some(exe.path().to_path_buf());
    profile.companion_args_template = Some("-rfbport %d -connect localhost:%d".into());

    let supervisor = Arc::new(FakeSupervisor::new(&journal));
    let extender = RecordingExtender {
        journal: journal.clone(),
        ..Default::default()
    };
    let session = SupportSession::new(profile, Arc::new(extender))
        .unwrap()
        .with_transport(FakeTransport::new(&journal))
        .with_supervisor(supervisor.clone());

    session.connect(None).await.unwrap();
    session.start_session(None).await.unwrap();

    let spawned = supervisor.spawned.lock().clone();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0][0], exe.path().to_string_lossy());
    assert_eq!(
        &spawned[0][1..],
        ["-rfbport", "5900", "-connect", "localhost:5900"]
    );

    session.stop_session().await;
    assert_eq!(journal.count("kill"), 1);
}

#[tokio::test]
async fn test_forward_without_access_code_keeps_state() {
    let journal = Journal::default();
    let session = session(profile(TunnelDirection::Forward), &journal);
    session.connect(None).await.unwrap();

    let err = session.start_session(None).await.unwrap_err();
    assert!(matches!(err, SupportError::MissingAccessCode));
    assert_eq!(err.kind(), FailureKind::Validation);
    assert_eq!(session.state().await, SessionState::Connected);
    assert_eq!(journal.count("forward"), 0);
}

#[tokio::test]
async fn test_reverse_ignores_access_code() {
    let journal = Journal::default();
    let session = session(profile(TunnelDirection::Reverse), &journal);
    session.connect(None).await.unwrap();

    let code = session.start_session(Some(12345)).await.unwrap();
    assert_eq!(code, ALLOCATED_PORT);
    assert_eq!(journal.count("forward"), 0);
    session.stop_session().await;
}

#[tokio::test]
async fn test_stop_on_fresh_session_is_noop() {
    let journal = Journal::default();
    let session = session(profile(TunnelDirection::Reverse), &journal);

    session.stop_session().await;
    assert_eq!(session.state().await, SessionState::Idle);
    assert!(journal.events().is_empty());
}

#[tokio::test]
async fn test_second_stop_does_nothing() {
    let journal = Journal::default();
    let exe = tempfile::NamedTempFile::new().unwrap();
    let mut profile = profile(TunnelDirection::Reverse);
    profile.companion_executable_path = Some(exe.path().to_path_buf());
    let session = session(profile, &journal);

    session.connect(None).await.unwrap();
    session.start_session(None).await.unwrap();
    session.stop_session().await;
    let after_first = journal.events();

    session.stop_session().await;
    assert_eq!(journal.events(), after_first);
    assert_eq!(session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_concurrent_stops_serialize() {
    let journal = Journal::default();
    let session = Arc::new(session(profile(TunnelDirection::Reverse), &journal));
    session.connect(None).await.unwrap();
    session.start_session(None).await.unwrap();

    tokio::join!(session.stop_session(), session.stop_session());
    assert_eq!(journal.count("session_stop"), 1);
    assert_eq!(journal.count("disconnect"), 1);
}

#[tokio::test]
async fn test_stop_hook_skipped_when_no_session_started() {
    let journal = Journal::default();
    let session = session(profile(TunnelDirection::Reverse), &journal);
    session.connect(None).await.unwrap();

    session.stop_session().await;
    assert_eq!(journal.count("session_stop"), 0);
    assert_eq!(journal.count("disconnect"), 1);
    assert_eq!(session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_stop_ordering() {
    let journal = Journal::default();
    let exe = tempfile::NamedTempFile::new().unwrap();
    let mut profile = profile(TunnelDirection::Reverse);
    profile.companion_executable_path = Some(exe.path().to_path_buf());

    let extender = RecordingExtender {
        journal: journal.clone(),
        start_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let session = session_with(profile, extender, FakeSupervisor::new(&journal));
    session.connect(None).await.unwrap();
    session.start_session(None).await.unwrap();
    session.stop_session().await;

    let start = journal.position("session_start");
    let kill = journal.position("kill");
    let stop = journal.position("session_stop");
    let disconnect = journal.position("disconnect");
    assert!(start < kill, "{:?}", journal.events());
    assert!(kill < stop);
    assert!(stop < disconnect);
}

#[tokio::test]
async fn test_session_start_error_is_swallowed() {
    let journal = Journal::default();
    let extender = RecordingExtender {
        journal: journal.clone(),
        fail_start: true,
        ..Default::default()
    };
    let session = session_with(
        profile(TunnelDirection::Reverse),
        extender,
        FakeSupervisor::new(&journal),
    );

    session.connect(None).await.unwrap();
    assert_eq!(session.start_session(None).await.unwrap(), ALLOCATED_PORT);
    session.stop_session().await;

    assert_eq!(journal.count("session_start Some(54321)"), 1);
    assert_eq!(session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_stop_hook_panic_is_contained() {
    let journal = Journal::default();
    let extender = RecordingExtender {
        journal: journal.clone(),
        panic_on_stop: true,
        ..Default::default()
    };
    let session = session_with(
        profile(TunnelDirection::Reverse),
        extender,
        FakeSupervisor::new(&journal),
    );

    session.connect(None).await.unwrap();
    session.start_session(None).await.unwrap();
    session.stop_session().await;

    assert_eq!(journal.count("disconnect"), 1);
    assert_eq!(session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_pre_connect_error_aborts_connect() {
    let journal = Journal::default();
    let extender = RecordingExtender {
        journal: journal.clone(),
        fail_pre_connect: true,
        ..Default::default()
    };
    let session = session_with(
        profile(TunnelDirection::Reverse),
        extender,
        FakeSupervisor::new(&journal),
    );

    let err = session.connect(None).await.unwrap_err();
    assert!(matches!(
        err,
        SupportError::Hook {
            hook: "on_pre_connect",
            ..
        }
    ));
    assert_eq!(err.kind(), FailureKind::Extension);
    assert_eq!(session.state().await, SessionState::Idle);
    assert_eq!(journal.count("connect"), 0);
}

#[tokio::test]
async fn test_transport_error_keeps_session_idle() {
    let journal = Journal::default();
    let mut transport = FakeTransport::new(&journal);
    transport.fail_connect = true;
    let extender = RecordingExtender {
        journal: journal.clone(),
        ..Default::default()
    };
    let session = SupportSession::new(profile(TunnelDirection::Reverse), Arc::new(extender))
        .unwrap()
        .with_transport(transport);

    let err = session.connect(None).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Connection);
    assert!(err.kind().is_retryable());
    assert_eq!(session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_unknown_hosts_need_a_prompt() {
    let journal = Journal::default();
    let mut trusting = profile(TunnelDirection::Reverse);
    trusting.allow_unknown_host = true;

    let without_prompt = session(trusting.clone(), &journal);
    let err = without_prompt.connect(None).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::InvalidOperation);
    assert_eq!(journal.events(), ["pre_connect Idle"]);
    assert_eq!(without_prompt.state().await, SessionState::Idle);

    let with_prompt = session(trusting, &journal).with_host_key_prompt(|_| true);
    with_prompt.connect(None).await.unwrap();
    assert_eq!(with_prompt.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_spawn_failure_rolls_back_tunnel() {
    let journal = Journal::default();
    let exe = tempfile::NamedTempFile::new().unwrap();
    let mut profile = profile(TunnelDirection::Forward);
    profile.companion_executable_path = Some(exe.path().to_path_buf());

    let mut supervisor = FakeSupervisor::new(&journal);
    supervisor.fail = true;
    let extender = RecordingExtender {
        journal: journal.clone(),
        ..Default::default()
    };
    let session = session_with(profile, extender, supervisor);
    session.connect(None).await.unwrap();

    let err = session.start_session(Some(12345)).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Process);
    assert_eq!(session.state().await, SessionState::Connected);
    assert_eq!(session.remote_port().await, None);
    assert_eq!(journal.count("close_tunnels"), 1);
    assert_eq!(journal.count("session_start"), 0);
}

#[tokio::test]
async fn test_lifecycle_guards() {
    let journal = Journal::default();
    let session = session(profile(TunnelDirection::Reverse), &journal);

    let err = session.start_session(None).await.unwrap_err();
    assert!(matches!(err, SupportError::InvalidOperation(_)));

    session.connect(None).await.unwrap();
    let err = session.connect(None).await.unwrap_err();
    assert!(matches!(err, SupportError::InvalidOperation(_)));

    session.start_session(None).await.unwrap();
    let err = session.start_session(None).await.unwrap_err();
    assert!(matches!(err, SupportError::InvalidOperation(_)));

    session.stop_session().await;
    session.connect(None).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);
    session.stop_session().await;
}

#[test]
fn test_missing_companion_is_rejected_up_front() {
    let mut profile = profile(TunnelDirection::Reverse);
    profile.companion_executable_path = Some("/nonexistent/x11vnc".into());

    let err = SupportSession::new(profile, Arc::new(RecordingExtender::default())).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
}

#[tokio::test]
async fn test_rejected_tunnel_leaves_session_connected() {
    let journal = Journal::default();
    let exe = tempfile::NamedTempFile::new().unwrap();

    for (direction, code) in [
        (TunnelDirection::Forward, Some(12345)),
        (TunnelDirection::Reverse, None),
    ] {
        let mut profile = profile(direction);
        profile.companion_executable_path = Some(exe.path().to_path_buf());

        let mut transport = FakeTransport::new(&journal);
        transport.fail_tunnel = true;
        let extender = RecordingExtender {
            journal: journal.clone(),
            ..Default::default()
        };
        let session = SupportSession::new(profile, Arc::new(extender))
            .unwrap()
            .with_transport(transport)
            .with_supervisor(Arc::new(FakeSupervisor::new(&journal)));
        session.connect(None).await.unwrap();

        let err = session.start_session(code).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Tunnel);
        assert!(matches!(
            err,
            SupportError::Transport(SshError::TunnelRejected(_))
        ));
        assert_eq!(session.state().await, SessionState::Connected);
        assert_eq!(session.remote_port().await, None);

        session.stop_session().await;
    }

    assert_eq!(journal.count("spawn"), 0);
    assert_eq!(journal.count("session_start"), 0);
    assert_eq!(journal.count("session_stop"), 0);
}

#[tokio::test]
async fn test_failed_companion_kill_still_tears_down() {
    let journal = Journal::default();
    let exe = tempfile::NamedTempFile::new().unwrap();
    let mut profile = profile(TunnelDirection::Reverse);
    profile.companion_executable_path = Some(exe.path().to_path_buf());

    let mut supervisor = FakeSupervisor::new(&journal);
    supervisor.kill_error = Some(io::ErrorKind::PermissionDenied);
    let extender = RecordingExtender {
        journal: journal.clone(),
        ..Default::default()
    };
    let session = session_with(profile, extender, supervisor);
    session.connect(None).await.unwrap();
    session.start_session(None).await.unwrap();

    session.stop_session().await;
    assert_eq!(session.state().await, SessionState::Idle);
    assert_eq!(journal.count("kill failed"), 1);
    assert_eq!(journal.count("session_stop"), 1);
    assert_eq!(journal.count("disconnect"), 1);
    assert!(journal.position("kill failed") < journal.position("disconnect"));
}
