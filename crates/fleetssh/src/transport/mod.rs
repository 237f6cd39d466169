//! Connections and channels a session drives.
//!
//! A [`Transport`] connects to one host; the resulting [`Connection`] opens any
//! number of [`Channel`]s, each running one remote command with its own
//! stdin/stdout/stderr pipes and a terminal [`ChannelExit`].

mod askpass;
mod openssh;
mod process;
#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;

use async_trait::async_trait;
use fleet_protocol::Host;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub use openssh::{OpenSshTransport, SshOptions};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How a channel ended. Transports must keep these two cases apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelExit {
    /// The remote command exited and reported a status.
    Status(i32),
    /// The channel died without a status: dropped connection, signal, teardown.
    Abnormal(String),
}

#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub command: String,
    pub pty: bool,
    pub forward_agent: bool,
    /// Cancelling tears the channel down; its exit then resolves as abnormal.
    pub cancel: CancellationToken,
}

impl ChannelRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            pty: false,
            forward_agent: false,
            cancel: CancellationToken::new(),
        }
    }
}

pub struct Channel {
    pub stdin: BoxWriter,
    pub stdout: BoxReader,
    pub stderr: BoxReader,
    pub exit: BoxFuture<'static, anyhow::Result<ChannelExit>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &Host) -> anyhow::Result<Box<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self, request: ChannelRequest) -> anyhow::Result<Channel>;

    /// Binds an authentication agent socket to this connection so channels
    /// opened with `forward_agent` can reach it.
    fn enable_agent_forwarding(&self, socket: &Path) -> anyhow::Result<()>;

    async fn close(self: Box<Self>);
}

pub struct Captured {
    pub exit: ChannelExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Captured {
    /// Both streams as text, for error messages.
    pub fn detail(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        format!("{}{}", stdout, stderr).trim().to_string()
    }
}

/// Runs `command` on its own channel with stdin closed and collects its output.
pub async fn run_capture(connection: &dyn Connection, command: &str) -> anyhow::Result<Captured> {
    let channel = connection.open_channel(ChannelRequest::new(command)).await?;
    let Channel {
        stdin,
        mut stdout,
        mut stderr,
        exit,
    } = channel;
    drop(stdin);
    let (stdout_bytes, stderr_bytes) = tokio::join!(read_all(&mut stdout), read_all(&mut stderr));
    let exit = exit.await?;
    Ok(Captured {
        exit,
        stdout: stdout_bytes?,
        stderr: stderr_bytes?,
    })
}

async fn read_all(reader: &mut BoxReader) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(buffer)
}
