use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use fleet_protocol::Host;
use futures_util::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::askpass::{apply_askpass_env, ensure_askpass_script};
use super::process::{apply_process_group, run_control_command, terminate_child};
use super::{Channel, ChannelExit, ChannelRequest, Connection, Transport};
use crate::auth::{Auth, AuthMethod};

const CONTROL_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_SOCKET_POLL: Duration = Duration::from_millis(50);
/// `ssh` reports its own failures with this status.
const SSH_FAILURE_STATUS: i32 = 255;
const STDERR_TAIL: usize = 1024;

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub port: u16,
    pub ssh_args: Vec<String>,
    pub control_dir: PathBuf,
    pub connect_timeout: Duration,
}

/// How the control master logs in.
enum Login {
    /// Key file and agent identities, never prompting.
    Keys,
    Password(String),
}

impl Login {
    fn label(&self) -> &'static str {
        match self {
            Login::Keys => "keys",
            Login::Password(_) => "password",
        }
    }
}

/// One OpenSSH control master per host; channels are multiplexed `ssh` clients.
pub struct OpenSshTransport {
    options: Arc<SshOptions>,
    auth: Arc<Auth>,
    askpass: Option<PathBuf>,
}

impl OpenSshTransport {
    pub fn new(options: SshOptions, auth: Arc<Auth>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&options.control_dir).with_context(|| {
            format!("failed to create {}", options.control_dir.display())
        })?;
        let askpass = if auth.has_password() {
            Some(ensure_askpass_script(&options.control_dir)?)
        } else {
            None
        };
        Ok(Self {
            options: Arc::new(options),
            auth,
            askpass,
        })
    }

    async fn start_master(&self, host: &Host, login: Login) -> anyhow::Result<(Child, PathBuf)> {
        let control_path = self
            .options
            .control_dir
            .join(format!("{}.sock", Uuid::new_v4().simple()));

        let mut cmd = Command::new("ssh");
        if let Login::Password(password) = &login {
            let script = self
                .askpass
                .as_deref()
                .context("password login without an askpass helper")?;
            info!(event = "ssh.auth.askpass", host = %host, "using SSH_ASKPASS for password auth");
            apply_askpass_env(&mut cmd, script, password);
        }
        cmd.args(master_args(
            &self.options,
            &self.auth,
            &login,
            &control_path,
            host,
        ));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_process_group(&mut cmd);

        debug!(
            host = %host,
            login = login.label(),
            control_path = %control_path.display(),
            "starting ssh master"
        );
        let mut master = cmd.spawn().context("spawn ssh master")?;
        if let Err(err) =
            wait_for_master(&mut master, &control_path, self.options.connect_timeout).await
        {
            let _ = terminate_child(&mut master).await;
            let _ = std::fs::remove_file(&control_path);
            return Err(err.context(format!("ssh to {host} failed")));
        }
        Ok((master, control_path))
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn connect(&self, host: &Host) -> anyhow::Result<Box<dyn Connection>> {
        let (mut master, control_path) =
            login(&self.auth, host, |login| self.start_master(host, login)).await?;
        spawn_stderr_logger(&mut master, host.clone());

        Ok(Box::new(OpenSshConnection {
            host: host.clone(),
            options: Arc::clone(&self.options),
            control_path,
            master,
            forwarded_agent: self.auth.forwarded_agent().map(Path::to_path_buf),
            forwarding_armed: AtomicBool::new(false),
        }))
    }
}

/// Tries key-based login first and falls back to a password only when the
/// server rejected the keys. The password is never requested otherwise.
async fn login<T, F, Fut>(auth: &Auth, host: &Host, mut attempt: F) -> anyhow::Result<T>
where
    F: FnMut(Login) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if auth.has_key_methods() || !auth.has_password() {
        match attempt(Login::Keys).await {
            Ok(value) => return Ok(value),
            Err(err) if auth.has_password() && is_auth_rejection(&format!("{err:#}")) => {
                debug!(host = %host, error = %format!("{err:#}"), "key login rejected, trying password");
            }
            Err(err) => return Err(err),
        }
    }
    let password = auth.password().await?;
    attempt(Login::Password(password)).await
}

struct OpenSshConnection {
    host: Host,
    options: Arc<SshOptions>,
    control_path: PathBuf,
    master: Child,
    /// Agent socket the master forwards, fixed when it was started.
    forwarded_agent: Option<PathBuf>,
    forwarding_armed: AtomicBool,
}

#[async_trait]
impl Connection for OpenSshConnection {
    async fn open_channel(&self, request: ChannelRequest) -> anyhow::Result<Channel> {
        if request.forward_agent && !self.forwarding_armed.load(Ordering::SeqCst) {
            anyhow::bail!("agent forwarding not enabled on connection");
        }
        let mut cmd = Command::new("ssh");
        cmd.args(channel_args(
            &self.options,
            &self.control_path,
            &self.host,
            &request,
        ));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("open channel on {}", self.host))?;
        let stdin = child.stdin.take().context("missing stdin")?;
        let stdout = child.stdout.take().context("missing stdout")?;
        let stderr = child.stderr.take().context("missing stderr")?;

        let tail = Arc::new(Mutex::new(Vec::new()));
        let stderr = TailReader {
            inner: stderr,
            tail: Arc::clone(&tail),
        };
        let exit = wait_channel(
            child,
            request.cancel.clone(),
            self.control_path.clone(),
            self.host.clone(),
            tail,
        )
        .boxed();

        Ok(Channel {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
        })
    }

    fn enable_agent_forwarding(&self, socket: &Path) -> anyhow::Result<()> {
        match self.forwarded_agent.as_deref() {
            Some(forwarded) if forwarded == socket => {
                self.forwarding_armed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(forwarded) => anyhow::bail!(
                "ssh master for {} forwards {}, not {}",
                self.host,
                forwarded.display(),
                socket.display()
            ),
            None => anyhow::bail!("ssh master for {} was started without agent forwarding", self.host),
        }
    }

    async fn close(mut self: Box<Self>) {
        let mut cmd = control_command(&self.control_path, "exit", &self.host);
        match run_control_command(&mut cmd, CONTROL_COMMAND_TIMEOUT, "ssh -O exit").await {
            Ok(output) if output.status.success() => {}
            Ok(output) => debug!(
                host = %self.host,
                detail = %String::from_utf8_lossy(&output.stderr).trim(),
                "ssh -O exit reported failure"
            ),
            Err(err) => debug!(host = %self.host, error = %err, "ssh -O exit failed"),
        }
        if let Ok(None) = self.master.try_wait() {
            let _ = terminate_child(&mut self.master).await;
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

fn control_command(control_path: &Path, operation: &str, host: &Host) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg(operation)
        .arg(host.as_str());
    cmd
}

fn master_args(
    options: &SshOptions,
    auth: &Auth,
    login: &Login,
    control_path: &Path,
    host: &Host,
) -> Vec<String> {
    let mut args = vec![
        "-M".to_string(),
        "-N".to_string(),
        "-S".to_string(),
        control_path.display().to_string(),
        "-o".to_string(),
        "ControlPersist=no".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", options.connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
        "-p".to_string(),
        options.port.to_string(),
        "-l".to_string(),
        options.user.clone(),
    ];
    args.extend(auth_args(auth.methods(), login));
    // The master owns the session channels, so it is the one that forwards.
    if let Some(socket) = auth.forwarded_agent() {
        args.push("-o".to_string());
        args.push(format!("ForwardAgent={}", socket.display()));
    }
    args.extend(options.ssh_args.iter().cloned());
    args.push(host.as_str().to_string());
    args
}

fn auth_args(methods: &[AuthMethod], login: &Login) -> Vec<String> {
    let mut args = Vec::new();
    match login {
        Login::Keys => {
            for method in methods {
                if let AuthMethod::PublicKey(path) = method {
                    args.push("-i".to_string());
                    args.push(path.display().to_string());
                }
            }
            if !methods.contains(&AuthMethod::Agent) {
                args.push("-o".to_string());
                args.push("IdentityAgent=none".to_string());
            }
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
            if methods
                .iter()
                .any(|method| !matches!(method, AuthMethod::Password))
            {
                args.push("-o".to_string());
                args.push("PreferredAuthentications=publickey".to_string());
            }
        }
        Login::Password(_) => {
            args.push("-o".to_string());
            args.push("PubkeyAuthentication=no".to_string());
            args.push("-o".to_string());
            args.push("NumberOfPasswordPrompts=1".to_string());
            args.push("-o".to_string());
            args.push("PreferredAuthentications=keyboard-interactive,password".to_string());
        }
    }
    args
}

fn channel_args(
    options: &SshOptions,
    control_path: &Path,
    host: &Host,
    request: &ChannelRequest,
) -> Vec<String> {
    let mut args = vec![
        "-S".to_string(),
        control_path.display().to_string(),
        "-o".to_string(),
        "ControlMaster=no".to_string(),
        "-p".to_string(),
        options.port.to_string(),
        "-l".to_string(),
        options.user.clone(),
    ];
    args.push(if request.pty { "-tt" } else { "-T" }.to_string());
    if request.forward_agent {
        args.push("-A".to_string());
    }
    args.push(host.as_str().to_string());
    args.push("--".to_string());
    args.push(request.command.clone());
    args
}

async fn wait_channel(
    mut child: Child,
    cancel: CancellationToken,
    control_path: PathBuf,
    host: Host,
    tail: Arc<Mutex<Vec<u8>>>,
) -> anyhow::Result<ChannelExit> {
    let status = tokio::select! {
        status = child.wait() => status.context("wait on ssh channel")?,
        _ = cancel.cancelled() => {
            terminate_child(&mut child).await;
            return Ok(ChannelExit::Abnormal("channel torn down".to_string()));
        }
    };
    if let Some(exit) = settled_exit(status) {
        return Ok(exit);
    }
    let alive = master_alive(&control_path, &host).await;
    let tail = tail
        .lock()
        .map(|tail| String::from_utf8_lossy(&tail).into_owned())
        .unwrap_or_default();
    let exit = classify_ssh_failure(alive, &tail);
    debug!(host = %host, master_alive = alive, exit = ?exit, "channel exited with status 255");
    Ok(exit)
}

/// Statuses that need no further checks. `None` means `ssh` may have failed
/// itself and the master must be asked.
fn settled_exit(status: ExitStatus) -> Option<ChannelExit> {
    match status.code() {
        Some(SSH_FAILURE_STATUS) => None,
        Some(code) => Some(ChannelExit::Status(code)),
        None => Some(ChannelExit::Abnormal("ssh terminated by signal".to_string())),
    }
}

/// Status 255 is the remote command's own only while the master is still up
/// and the client printed no diagnostics of its own.
fn classify_ssh_failure(master_alive: bool, stderr_tail: &str) -> ChannelExit {
    let diagnostic = ssh_diagnostic(stderr_tail);
    if !master_alive {
        return ChannelExit::Abnormal(match diagnostic {
            Some(line) => format!("connection lost: {line}"),
            None => "connection lost".to_string(),
        });
    }
    match diagnostic {
        Some(line) => ChannelExit::Abnormal(line.to_string()),
        None => ChannelExit::Status(SSH_FAILURE_STATUS),
    }
}

fn ssh_diagnostic(stderr_tail: &str) -> Option<&str> {
    stderr_tail.lines().rev().map(str::trim).find(|line| {
        line.starts_with("mux_client_")
            || line.starts_with("Control socket connect")
            || line.starts_with("client_loop: ")
            || line.starts_with("packet_write_wait")
            || line.starts_with("ssh: ")
            || (line.starts_with("Connection to ") && line.contains(" closed"))
    })
}

async fn master_alive(control_path: &Path, host: &Host) -> bool {
    if !control_path.exists() {
        return false;
    }
    let mut cmd = control_command(control_path, "check", host);
    matches!(
        run_control_command(&mut cmd, CONTROL_COMMAND_TIMEOUT, "ssh -O check").await,
        Ok(output) if output.status.success()
    )
}

/// Passes reads through and keeps the last bytes seen.
struct TailReader<R> {
    inner: R,
    tail: Arc<Mutex<Vec<u8>>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for TailReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if let Ok(mut tail) = this.tail.lock() {
                tail.extend_from_slice(&buf.filled()[before..]);
                let excess = tail.len().saturating_sub(STDERR_TAIL);
                tail.drain(..excess);
            }
        }
        poll
    }
}

async fn wait_for_master(
    master: &mut Child,
    control_path: &Path,
    connect_timeout: Duration,
) -> anyhow::Result<()> {
    let start = Instant::now();
    // Authentication may take a few round trips after the TCP connect.
    let limit = connect_timeout.saturating_mul(2);
    loop {
        if let Some(status) = master.try_wait()? {
            let mut stderr = Vec::new();
            if let Some(mut pipe) = master.stderr.take() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            anyhow::bail!(format_ssh_failure(status, &stderr));
        }
        if control_path.exists() {
            return Ok(());
        }
        if start.elapsed() >= limit {
            anyhow::bail!("control socket not ready after {}s", limit.as_secs());
        }
        tokio::time::sleep(CONTROL_SOCKET_POLL).await;
    }
}

fn spawn_stderr_logger(master: &mut Child, host: Host) {
    let Some(stderr) = master.stderr.take() else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(host = %host, line = %line, "ssh master");
        }
    });
}

fn format_ssh_failure(status: ExitStatus, stderr: &[u8]) -> String {
    let detail = String::from_utf8_lossy(stderr).trim().to_string();
    let mut message = if detail.is_empty() {
        format!("ssh master exited with {status}")
    } else {
        detail.clone()
    };
    if let Some(hint) = ssh_auth_hint(&detail) {
        message.push_str(" (");
        message.push_str(hint);
        message.push(')');
    }
    message
}

fn is_auth_rejection(detail: &str) -> bool {
    let detail = detail.to_lowercase();
    detail.contains("permission denied")
        || detail.contains("too many authentication failures")
        || detail.contains("no supported authentication methods available")
}

fn ssh_auth_hint(detail: &str) -> Option<&'static str> {
    if is_auth_rejection(detail) {
        return Some("check --key-file, the agent, or the password");
    }
    if detail.to_lowercase().contains("host key verification failed") {
        return Some("the host key changed; fix known_hosts");
    }
    None
}
