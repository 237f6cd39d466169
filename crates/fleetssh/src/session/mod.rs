//! One host, one connection, one command.

mod elevate;
mod relay;
mod staging;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{CommandSpec, Host, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::Auth;
use crate::error::SessionError;
use crate::sink::EventSender;
use crate::transport::{Channel, ChannelExit, ChannelRequest, Connection, Transport};

use elevate::{shell_escape, wrap_command};
use relay::relay;

/// How long relays may keep draining once the command has exited.
const RELAY_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Running,
    Terminated,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Running => "running",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Session {
    host: Host,
    transport: Arc<dyn Transport>,
    auth: Arc<Auth>,
    events: EventSender,
    state: SessionState,
    connection: Option<Box<dyn Connection>>,
}

impl Session {
    pub fn new(
        host: Host,
        transport: Arc<dyn Transport>,
        auth: Arc<Auth>,
        events: EventSender,
    ) -> Self {
        Self {
            host,
            transport,
            auth,
            events,
            state: SessionState::Idle,
            connection: None,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(self.unexpected_state(SessionState::Idle));
        }
        match self.transport.connect(&self.host).await {
            Ok(connection) => {
                debug!(host = %self.host, "connected");
                self.connection = Some(connection);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Terminated;
                Err(SessionError::Connect(err))
            }
        }
    }

    /// Runs `spec` to completion. Any exit status is `Ok`; only failures of
    /// the session itself are errors.
    pub async fn run(&mut self, spec: &CommandSpec) -> Result<i32, SessionError> {
        if self.state != SessionState::Connected {
            return Err(self.unexpected_state(SessionState::Connected));
        }
        self.state = SessionState::Running;
        let result = self.drive(spec).await;
        self.state = SessionState::Terminated;
        match &result {
            Ok(code) => info!(host = %self.host, code, "command exited"),
            Err(err) => info!(host = %self.host, error = %err, "command failed"),
        }
        result
    }

    pub async fn close(self) {
        if let Some(connection) = self.connection {
            connection.close().await;
            debug!(host = %self.host, "connection closed");
        }
    }

    fn unexpected_state(&self, expected: SessionState) -> SessionError {
        SessionError::InvalidState {
            state: self.state.as_str(),
            expected: expected.as_str(),
        }
    }

    async fn drive(&self, spec: &CommandSpec) -> Result<i32, SessionError> {
        let connection = self
            .connection
            .as_deref()
            .ok_or_else(|| self.unexpected_state(SessionState::Connected))?;

        let staged = if spec.files.is_empty() {
            None
        } else {
            Some(
                staging::stage_files(connection, &self.host, &spec.files)
                    .await
                    .map_err(SessionError::Staging)?,
            )
        };

        let command = build_command(spec, staged.as_deref());
        let result = self.execute(connection, spec, command).await;

        if let Some(dir) = staged.as_deref() {
            staging::cleanup(connection, &self.host, dir).await;
        }
        result
    }

    async fn execute(
        &self,
        connection: &dyn Connection,
        spec: &CommandSpec,
        command: String,
    ) -> Result<i32, SessionError> {
        if spec.forward_agent {
            self.auth.forward_agent(connection).map_err(|err| {
                SessionError::Protocol(err.context("agent forwarding setup failed"))
            })?;
        }

        let cancel = CancellationToken::new();
        let request = ChannelRequest {
            command,
            pty: spec.wants_pty(),
            forward_agent: spec.forward_agent,
            cancel: cancel.clone(),
        };
        debug!(host = %self.host, command = %request.command, pty = request.pty, "opening channel");
        let Channel {
            stdin,
            stdout,
            stderr,
            mut exit,
        } = connection
            .open_channel(request)
            .await
            .map_err(|err| SessionError::Protocol(err.context("failed to open channel")))?;

        let stdout_task = if spec.elevate {
            tokio::spawn(elevate::answer_prompt(
                self.host.clone(),
                stdout,
                stdin,
                self.events.clone(),
                Arc::clone(&self.auth),
            ))
        } else {
            drop(stdin);
            tokio::spawn(relay(stdout, Stream::Stdout, self.events.clone()))
        };
        let stderr_task = tokio::spawn(relay(stderr, Stream::Stderr, self.events.clone()));

        let waited = tokio::time::timeout(spec.timeout, &mut exit).await;
        let (exit, timed_out) = match waited {
            Ok(exit) => (exit, false),
            Err(_) => {
                debug!(host = %self.host, "deadline fired, tearing channel down");
                cancel.cancel();
                (exit.await, true)
            }
        };

        let drained = tokio::time::timeout(RELAY_DRAIN, async {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
        })
        .await;
        if drained.is_err() {
            debug!(host = %self.host, "relays still running after exit");
        }

        if timed_out {
            return Err(SessionError::Timeout(spec.timeout));
        }
        match exit.map_err(SessionError::Protocol)? {
            ChannelExit::Status(code) => {
                self.events.exit(code).await;
                Ok(code)
            }
            ChannelExit::Abnormal(reason) => Err(SessionError::Abnormal(reason)),
        }
    }
}

fn build_command(spec: &CommandSpec, staged_dir: Option<&str>) -> String {
    let command = match staged_dir {
        Some(dir) => format!("cd {}; {}", shell_escape(dir), spec.command),
        None => spec.command.clone(),
    };
    if spec.elevate {
        wrap_command(&command)
    } else {
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{remote_sink, RemoteSource};
    use crate::transport::testing::{exits_with, with_staging, FakeTransport};
    use fleet_protocol::staging::parse_file_header;
    use fleet_protocol::OutputEvent;
    use futures_util::FutureExt;
    use std::sync::Mutex;

    fn spec(command: &str) -> CommandSpec {
        CommandSpec::new(command, Duration::from_secs(5))
    }

    fn new_session(transport: FakeTransport, auth: Auth, host: &str) -> (Session, RemoteSource) {
        let (sink, source) = remote_sink(Host::from(host));
        let session = Session::new(
            Host::from(host),
            Arc::new(transport),
            Arc::new(auth),
            sink.events(),
        );
        (session, source)
    }

    async fn events(mut source: RemoteSource) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = source.events.recv().await {
            events.push(event);
        }
        events
    }

    fn text(events: &[OutputEvent], stream: Stream) -> String {
        events
            .iter()
            .filter(|event| event.stream == stream)
            .map(|event| String::from_utf8_lossy(&event.data).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn relays_output_and_reports_exit_status() {
        let transport = FakeTransport::new().on("a", |mut io| {
            async move {
                io.out("hello\n").await;
                io.err("warn\n").await;
                ChannelExit::Status(3)
            }
            .boxed()
        });
        let (mut session, source) = new_session(transport.clone(), Auth::with_password("pw"), "a");

        session.connect().await.expect("connect");
        assert_eq!(session.state(), SessionState::Connected);
        let code = session.run(&spec("make")).await.expect("run");
        assert_eq!(code, 3);
        assert_eq!(session.state(), SessionState::Terminated);
        session.close().await;

        let events = events(source).await;
        assert_eq!(text(&events, Stream::Stdout), "hello\n");
        assert_eq!(text(&events, Stream::Stderr), "warn\n");
        let last = events.last().expect("exit notice");
        assert_eq!(last.stream, Stream::Exit);
        assert_eq!(&last.data[..], b"Exited with code: 3\n");

        let channels = transport.channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].command, "make");
        assert!(!channels[0].pty);
    }

    #[tokio::test]
    async fn connect_failure_never_reaches_running() {
        let transport = FakeTransport::new().refuse("c", "Connection refused");
        let (mut session, source) = new_session(transport.clone(), Auth::with_password("pw"), "c");

        let err = session.connect().await.expect_err("refused");
        assert!(matches!(err, SessionError::Connect(_)));
        assert!(err.to_string().contains("Connection refused"));
        assert_eq!(session.state(), SessionState::Terminated);

        let err = session.run(&spec("true")).await.expect_err("not connected");
        assert!(matches!(err, SessionError::InvalidState { .. }));
        session.close().await;

        assert!(events(source).await.is_empty());
        assert!(transport.channels().is_empty());
    }

    #[tokio::test]
    async fn run_before_connect_is_a_protocol_error() {
        let (mut session, _source) = new_session(FakeTransport::new(), Auth::with_password("pw"), "a");
        let err = session.run(&spec("true")).await.expect_err("idle");
        assert_eq!(err.to_string(), "session is idle, expected connected");
        assert_eq!(err.kind(), fleet_protocol::FailureKind::Protocol);
    }

    #[tokio::test]
    async fn stages_files_then_runs_inside_the_directory_and_cleans_up() {
        let dir = std::env::temp_dir().join(format!("fleetssh-stage-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let script = dir.join("setup.sh");
        std::fs::write(&script, b"echo staged\n").expect("write");

        let uploads = Arc::new(Mutex::new(Vec::new()));
        let transport =
            FakeTransport::new().on("a", with_staging(Arc::clone(&uploads), exits_with(0, "ok\n")));
        let (mut session, source) = new_session(transport.clone(), Auth::with_password("pw"), "a");
        let mut command = spec("sh setup.sh");
        command.files = vec![script.clone()];

        session.connect().await.expect("connect");
        assert_eq!(session.run(&command).await.expect("run"), 0);
        session.close().await;
        let _ = std::fs::remove_dir_all(&dir);

        let uploaded = uploads.lock().expect("uploads").clone();
        let newline = uploaded.iter().position(|b| *b == b'\n').expect("header");
        let header = std::str::from_utf8(&uploaded[..=newline]).expect("utf8");
        let (_, len, name) = parse_file_header(header).expect("valid header");
        assert_eq!(name, "setup.sh");
        assert_eq!(len, 12);
        assert_eq!(&uploaded[newline + 1..], b"echo staged\n\0");

        let commands: Vec<String> = transport
            .channels()
            .into_iter()
            .map(|record| record.command)
            .collect();
        assert_eq!(
            commands,
            vec![
                "mktemp -d".to_string(),
                "/usr/bin/scp -tr '/tmp/fleetssh.Xy12'".to_string(),
                "cd '/tmp/fleetssh.Xy12'; sh setup.sh".to_string(),
                "rm -rf '/tmp/fleetssh.Xy12'".to_string(),
            ]
        );
        assert_eq!(text(&events(source).await, Stream::Stdout), "ok\n");
    }

    #[tokio::test]
    async fn cleanup_failure_keeps_the_exit_status() {
        let payload = std::env::temp_dir().join(format!("fleetssh-rm-{}", std::process::id()));
        std::fs::write(&payload, b"x").expect("write");
        let staged = with_staging(Arc::new(Mutex::new(Vec::new())), exits_with(4, "ran\n"));
        let transport = FakeTransport::new().on("a", move |mut io| {
            if io.request.command.starts_with("rm -rf") {
                async move {
                    io.err("rm: cannot remove '/tmp/fleetssh.Xy12': Device or resource busy\n")
                        .await;
                    ChannelExit::Status(1)
                }
                .boxed()
            } else {
                staged(io)
            }
        });
        let (mut session, source) = new_session(transport.clone(), Auth::with_password("pw"), "a");
        let mut command = spec("./run");
        command.files = vec![payload.clone()];

        session.connect().await.expect("connect");
        assert_eq!(session.run(&command).await.expect("cleanup is best effort"), 4);
        session.close().await;
        let _ = std::fs::remove_file(&payload);

        let commands: Vec<String> = transport
            .channels()
            .into_iter()
            .map(|record| record.command)
            .collect();
        assert_eq!(commands.last().map(String::as_str), Some("rm -rf '/tmp/fleetssh.Xy12'"));
        let events = events(source).await;
        assert_eq!(text(&events, Stream::Stdout), "ran\n");
        assert_eq!(text(&events, Stream::Stderr), "");
        assert_eq!(&events.last().expect("exit notice").data[..], b"Exited with code: 4\n");
    }

    #[tokio::test]
    async fn staging_failure_skips_the_command() {
        let transport = FakeTransport::new().on("a", |mut io| {
            let line = io.request.command.clone();
            async move {
                if line.starts_with("mktemp") {
                    io.out("/tmp/fleetssh.Xy12\n").await;
                    ChannelExit::Status(0)
                } else if line.starts_with("/usr/bin/scp") {
                    io.read_stdin_to_end().await;
                    io.err("scp: permission denied\n").await;
                    ChannelExit::Status(1)
                } else {
                    ChannelExit::Status(0)
                }
            }
            .boxed()
        });
        let (mut session, _source) = new_session(transport.clone(), Auth::with_password("pw"), "a");
        let payload = std::env::temp_dir().join(format!("fleetssh-f-{}", std::process::id()));
        std::fs::write(&payload, b"x").expect("write");
        let mut command = spec("run");
        command.files = vec![payload.clone()];

        session.connect().await.expect("connect");
        let err = session.run(&command).await.expect_err("staging fails");
        let _ = std::fs::remove_file(&payload);
        assert!(matches!(err, SessionError::Staging(_)));
        assert!(err.to_string().contains("permission denied"));

        let commands: Vec<String> = transport
            .channels()
            .into_iter()
            .map(|record| record.command)
            .collect();
        assert!(!commands.iter().any(|command| command == "run"));
        assert!(commands.iter().any(|command| command.starts_with("rm -rf")));
    }

    #[tokio::test]
    async fn deadline_tears_the_channel_down() {
        let transport = FakeTransport::new().on("a", |mut io| {
            async move {
                io.out("started\n").await;
                tokio::time::sleep(Duration::from_secs(30)).await;
                ChannelExit::Status(0)
            }
            .boxed()
        });
        let (mut session, source) = new_session(transport, Auth::with_password("pw"), "a");
        let command = CommandSpec::new("sleep 30", Duration::from_millis(50));

        session.connect().await.expect("connect");
        let err = session.run(&command).await.expect_err("timeout");
        assert!(matches!(err, SessionError::Timeout(_)));
        session.close().await;

        let events = events(source).await;
        assert_eq!(text(&events, Stream::Stdout), "started\n");
        assert!(events.iter().all(|event| event.stream != Stream::Exit));
    }

    #[tokio::test]
    async fn abnormal_termination_has_no_exit_notice() {
        let transport = FakeTransport::new().on("a", |_io| {
            async { ChannelExit::Abnormal("killed by signal 9".to_string()) }.boxed()
        });
        let (mut session, source) = new_session(transport, Auth::with_password("pw"), "a");

        session.connect().await.expect("connect");
        let err = session.run(&spec("true")).await.expect_err("abnormal");
        assert_eq!(err.to_string(), "command terminated abnormally: killed by signal 9");
        session.close().await;
        assert!(events(source).await.is_empty());
    }

    #[tokio::test]
    async fn elevation_wraps_command_and_requests_a_pty() {
        let transport = FakeTransport::new().on("a", |mut io| {
            async move {
                io.out("[sudo] password for core: ").await;
                let answer = io.read_stdin_to_end().await;
                io.out(&format!("\ngot {}\n", String::from_utf8_lossy(&answer).trim_end()))
                    .await;
                ChannelExit::Status(0)
            }
            .boxed()
        });
        let (mut session, source) = new_session(transport.clone(), Auth::with_password("hunter2"), "a");
        let mut command = spec("id -u");
        command.elevate = true;

        session.connect().await.expect("connect");
        assert_eq!(session.run(&command).await.expect("run"), 0);
        session.close().await;

        let record = &transport.channels()[0];
        assert_eq!(record.command, "/usr/bin/sudo /bin/bash -c 'id -u'");
        assert!(record.pty);
        assert_eq!(
            text(&events(source).await, Stream::Stdout),
            "[sudo] password for core: \ngot hunter2\n"
        );
    }

    #[tokio::test]
    async fn agent_forwarding_needs_an_agent() {
        let transport = FakeTransport::new().on_any(exits_with(0, ""));
        let mut command = spec("ssh-add -l");
        command.forward_agent = true;

        let (mut session, _source) = new_session(transport.clone(), Auth::with_password("pw"), "a");
        session.connect().await.expect("connect");
        let err = session.run(&command).await.expect_err("no agent");
        assert!(err.to_string().contains("no agent available"));
        session.close().await;

        let auth = Auth::with_password("pw").with_agent_socket("/tmp/agent.sock");
        let (mut session, _source) = new_session(transport.clone(), auth, "b");
        session.connect().await.expect("connect");
        assert_eq!(session.run(&command).await.expect("run"), 0);
        session.close().await;

        assert_eq!(transport.agent_forwarded(), vec![Host::from("b")]);
        let records = transport.channels();
        assert_eq!(records.len(), 1);
        assert!(records[0].forward_agent);
    }
}
