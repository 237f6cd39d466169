use std::io;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Runs a short-lived control command (`ssh -O ...`) and collects its output.
pub(super) async fn run_control_command(
    cmd: &mut Command,
    limit: Duration,
    label: &str,
) -> anyhow::Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().with_context(|| format!("spawn {label}"))?;
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let status = match tokio::time::timeout(limit, child.wait()).await {
        Ok(result) => result.with_context(|| format!("{label} failed"))?,
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            anyhow::bail!("{label} timed out after {}s", limit.as_secs());
        }
    };
    let mut stdout = Vec::new();
    if let Some(mut pipe) = stdout_pipe {
        let _ = pipe.read_to_end(&mut stdout).await;
    }
    let mut stderr = Vec::new();
    if let Some(mut pipe) = stderr_pipe {
        let _ = pipe.read_to_end(&mut stderr).await;
    }
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Puts the child in its own session so teardown reaches everything it spawned.
#[cfg(unix)]
pub(super) fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(super) fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

/// SIGTERM, then SIGKILL if the child ignores it.
pub(super) async fn terminate_child(child: &mut Child) -> Option<ExitStatus> {
    signal_group(child, libc::SIGTERM);
    if let Ok(status) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        return status.ok();
    }
    signal_group(child, libc::SIGKILL);
    let _ = child.kill().await;
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => None,
    }
}
