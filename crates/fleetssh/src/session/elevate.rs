//! Running a command under `sudo` and answering its password prompt.

use std::sync::Arc;

use bytes::Bytes;
use fleet_protocol::{Host, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::relay::relay;
use crate::auth::Auth;
use crate::sink::EventSender;
use crate::transport::{BoxReader, BoxWriter};

pub(super) const SUDO_PROMPT: &[u8] = b"[sudo] password for ";
const SCAN_SECTION: usize = 32;
/// Bytes of stdout after which we assume no prompt is coming.
const SCAN_LIMIT: usize = 64;

pub(super) fn wrap_command(command: &str) -> String {
    format!("/usr/bin/sudo /bin/bash -c {}", shell_escape(command))
}

pub(super) fn shell_escape(value: &str) -> String {
    let mut escaped = String::from("'");
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Relays stdout while watching its head for the sudo prompt. Answers it at
/// most once, then closes stdin and copies the rest untouched.
pub(super) async fn answer_prompt(
    host: Host,
    mut stdout: BoxReader,
    mut stdin: BoxWriter,
    events: EventSender,
    auth: Arc<Auth>,
) {
    let mut seen = Vec::with_capacity(SCAN_LIMIT + SCAN_SECTION);
    let mut section = [0u8; SCAN_SECTION];
    loop {
        let read = match stdout.read(&mut section).await {
            Ok(0) => return,
            Ok(read) => read,
            Err(err) => {
                debug!(host = %host, error = %err, "stdout read failed while scanning");
                return;
            }
        };
        if !events
            .send(Stream::Stdout, Bytes::copy_from_slice(&section[..read]))
            .await
        {
            return;
        }
        seen.extend_from_slice(&section[..read]);

        if contains(&seen, SUDO_PROMPT) {
            match auth.password().await {
                Ok(password) => {
                    if let Err(err) = write_password(&mut stdin, &password).await {
                        warn!(host = %host, error = %err, "failed to answer sudo prompt");
                    } else {
                        debug!(host = %host, "answered sudo prompt");
                    }
                }
                Err(err) => warn!(host = %host, error = %err, "sudo prompt with no password"),
            }
            break;
        }
        if seen.len() >= SCAN_LIMIT {
            debug!(host = %host, "no sudo prompt seen");
            break;
        }
    }
    drop(stdin);
    relay(stdout, Stream::Stdout, events).await;
}

async fn write_password(stdin: &mut BoxWriter, password: &str) -> std::io::Result<()> {
    stdin.write_all(password.as_bytes()).await?;
    stdin.write_all(b"\r").await?;
    stdin.flush().await
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
