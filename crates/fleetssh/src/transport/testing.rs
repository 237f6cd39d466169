//! In-memory transport driven by per-host scripts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_protocol::Host;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::{Channel, ChannelExit, ChannelRequest, Connection, Transport};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Remote side of one fake channel.
pub(crate) struct FakeIo {
    pub(crate) request: ChannelRequest,
    pub(crate) stdin: DuplexStream,
    pub(crate) stdout: DuplexStream,
    pub(crate) stderr: DuplexStream,
}

impl FakeIo {
    pub(crate) async fn out(&mut self, data: &str) {
        let _ = self.stdout.write_all(data.as_bytes()).await;
    }

    pub(crate) async fn err(&mut self, data: &str) {
        let _ = self.stderr.write_all(data.as_bytes()).await;
    }

    pub(crate) async fn read_stdin_to_end(&mut self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let _ = self.stdin.read_to_end(&mut buffer).await;
        buffer
    }
}

pub(crate) type Handler =
    Arc<dyn Fn(FakeIo) -> BoxFuture<'static, ChannelExit> + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct ChannelRecord {
    pub(crate) host: Host,
    pub(crate) command: String,
    pub(crate) pty: bool,
    pub(crate) forward_agent: bool,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
    connects: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    refused: Arc<HashMap<Host, String>>,
    handlers: Arc<HashMap<Host, Handler>>,
    default_handler: Option<Handler>,
    counters: Arc<Counters>,
    channels: Arc<Mutex<Vec<ChannelRecord>>>,
    agent_sockets: Arc<Mutex<Vec<Host>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn refuse(mut self, host: &str, reason: &str) -> Self {
        Arc::make_mut(&mut self.refused).insert(Host::from(host), reason.to_string());
        self
    }

    pub(crate) fn on<F>(mut self, host: &str, handler: F) -> Self
    where
        F: Fn(FakeIo) -> BoxFuture<'static, ChannelExit> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers).insert(Host::from(host), Arc::new(handler));
        self
    }

    pub(crate) fn on_any<F>(mut self, handler: F) -> Self
    where
        F: Fn(FakeIo) -> BoxFuture<'static, ChannelExit> + Send + Sync + 'static,
    {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn peak_active(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn channels(&self) -> Vec<ChannelRecord> {
        self.channels.lock().expect("channels lock").clone()
    }

    pub(crate) fn agent_forwarded(&self) -> Vec<Host> {
        self.agent_sockets.lock().expect("agent lock").clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, host: &Host) -> anyhow::Result<Box<dyn Connection>> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        if let Some(reason) = self.refused.get(host) {
            anyhow::bail!("{reason}");
        }
        let handler = self
            .handlers
            .get(host)
            .cloned()
            .or_else(|| self.default_handler.clone())
            .ok_or_else(|| anyhow::anyhow!("no script for {host}"))?;
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            host: host.clone(),
            handler,
            transport: self.clone(),
        }))
    }
}

struct FakeConnection {
    host: Host,
    handler: Handler,
    transport: FakeTransport,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn open_channel(&self, request: ChannelRequest) -> anyhow::Result<Channel> {
        self.transport
            .channels
            .lock()
            .expect("channels lock")
            .push(ChannelRecord {
                host: self.host.clone(),
                command: request.command.clone(),
                pty: request.pty,
                forward_agent: request.forward_agent,
            });

        let (stdin_local, stdin_remote) = duplex(PIPE_CAPACITY);
        let (stdout_remote, stdout_local) = duplex(PIPE_CAPACITY);
        let (stderr_remote, stderr_local) = duplex(PIPE_CAPACITY);
        let cancel = request.cancel.clone();
        let io = FakeIo {
            request,
            stdin: stdin_remote,
            stdout: stdout_remote,
            stderr: stderr_remote,
        };
        let mut script = tokio::spawn((*self.handler)(io));
        let exit = async move {
            tokio::select! {
                result = &mut script => result.map_err(|err| anyhow::anyhow!(err)),
                _ = cancel.cancelled() => {
                    script.abort();
                    Ok(ChannelExit::Abnormal("channel torn down".to_string()))
                }
            }
        }
        .boxed();

        Ok(Channel {
            stdin: Box::new(stdin_local),
            stdout: Box::new(stdout_local),
            stderr: Box::new(stderr_local),
            exit,
        })
    }

    fn enable_agent_forwarding(&self, _socket: &Path) -> anyhow::Result<()> {
        self.transport
            .agent_sockets
            .lock()
            .expect("agent lock")
            .push(self.host.clone());
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.transport.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Writes `stdout` then exits with `code`.
pub(crate) fn exits_with(
    code: i32,
    stdout: &'static str,
) -> impl Fn(FakeIo) -> BoxFuture<'static, ChannelExit> + Send + Sync + 'static {
    move |mut io: FakeIo| {
        async move {
            io.out(stdout).await;
            ChannelExit::Status(code)
        }
        .boxed()
    }
}

/// Answers the staging helpers (`mktemp`, `scp -t`, `rm -rf`) like a remote
/// shell would, recording uploaded bytes, and hands every other command to
/// `command`.
pub(crate) fn with_staging<F>(
    uploads: Arc<Mutex<Vec<u8>>>,
    command: F,
) -> impl Fn(FakeIo) -> BoxFuture<'static, ChannelExit> + Send + Sync + 'static
where
    F: Fn(FakeIo) -> BoxFuture<'static, ChannelExit> + Send + Sync + 'static,
{
    move |mut io: FakeIo| {
        let line = io.request.command.clone();
        if line.starts_with("mktemp -d") {
            async move {
                io.out("/tmp/fleetssh.Xy12\r\n").await;
                ChannelExit::Status(0)
            }
            .boxed()
        } else if line.starts_with("/usr/bin/scp -tr") {
            let uploads = Arc::clone(&uploads);
            async move {
                let data = io.read_stdin_to_end().await;
                uploads.lock().expect("uploads lock").extend_from_slice(&data);
                ChannelExit::Status(0)
            }
            .boxed()
        } else if line.starts_with("rm -rf") {
            async { ChannelExit::Status(0) }.boxed()
        } else {
            command(io)
        }
    }
}
