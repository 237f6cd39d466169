//! Copies local files into a fresh remote directory before the command runs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use fleet_protocol::staging::{file_header, FILE_TERMINATOR};
use fleet_protocol::Host;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::elevate::shell_escape;
use crate::transport::{run_capture, BoxWriter, Channel, ChannelExit, ChannelRequest, Connection};

/// Creates the remote directory and uploads `files` into it. On upload
/// failure the directory is removed before returning.
pub(super) async fn stage_files(
    connection: &dyn Connection,
    host: &Host,
    files: &[PathBuf],
) -> anyhow::Result<String> {
    let dir = create_remote_dir(connection).await?;
    debug!(host = %host, dir = %dir, files = files.len(), "staging files");
    if let Err(err) = upload(connection, &dir, files).await {
        cleanup(connection, host, &dir).await;
        return Err(err);
    }
    Ok(dir)
}

async fn create_remote_dir(connection: &dyn Connection) -> anyhow::Result<String> {
    let captured = run_capture(connection, "mktemp -d")
        .await
        .context("mktemp -d failed")?;
    match &captured.exit {
        ChannelExit::Status(0) => {}
        ChannelExit::Status(code) => {
            anyhow::bail!("mktemp -d exited with {code}: {}", captured.detail())
        }
        ChannelExit::Abnormal(reason) => anyhow::bail!("mktemp -d terminated: {reason}"),
    }
    let dir = String::from_utf8_lossy(&captured.stdout)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    if dir.is_empty() {
        anyhow::bail!("mktemp -d printed no path");
    }
    Ok(dir)
}

async fn upload(connection: &dyn Connection, dir: &str, files: &[PathBuf]) -> anyhow::Result<()> {
    let command = format!("/usr/bin/scp -tr {}", shell_escape(dir));
    let Channel {
        mut stdin,
        mut stdout,
        mut stderr,
        exit,
    } = connection
        .open_channel(ChannelRequest::new(command))
        .await
        .context("failed to open scp channel")?;

    let drain = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let _ = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        (out, err)
    };
    let send = async {
        let result = send_files(&mut stdin, files).await;
        let _ = stdin.shutdown().await;
        drop(stdin);
        result
    };
    let (sent, (_, err_output)) = tokio::join!(send, drain);
    let exit = exit.await.context("scp channel failed")?;
    sent?;

    match exit {
        ChannelExit::Status(0) => Ok(()),
        ChannelExit::Status(code) => anyhow::bail!(
            "scp exited with {code}: {}",
            String::from_utf8_lossy(&err_output).trim()
        ),
        ChannelExit::Abnormal(reason) => anyhow::bail!("scp terminated: {reason}"),
    }
}

async fn send_files(stdin: &mut BoxWriter, files: &[PathBuf]) -> anyhow::Result<()> {
    for path in files {
        let (mode, contents) = read_local(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let header = file_header(mode, contents.len() as u64, &name);
        stdin.write_all(header.as_bytes()).await?;
        stdin.write_all(&contents).await?;
        stdin.write_all(&[FILE_TERMINATOR]).await?;
    }
    stdin.flush().await?;
    Ok(())
}

async fn read_local(path: &Path) -> anyhow::Result<(u32, Vec<u8>)> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok((file_mode(&metadata), contents))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Removes the staged directory. Failures are only logged.
pub(super) async fn cleanup(connection: &dyn Connection, host: &Host, dir: &str) {
    let command = format!("rm -rf {}", shell_escape(dir));
    match run_capture(connection, &command).await {
        Ok(captured) if captured.exit == ChannelExit::Status(0) => {
            debug!(host = %host, dir = %dir, "removed staged files");
        }
        Ok(captured) => {
            warn!(host = %host, dir = %dir, detail = %captured.detail(), "failed to remove staged files");
        }
        Err(err) => warn!(host = %host, dir = %dir, error = %err, "failed to remove staged files"),
    }
}
