use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod staging;

/// Remote target for one command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Host(String);

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Host {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Host {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The command every session of a run executes. Shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub elevate: bool,
    pub force_pty: bool,
    pub forward_agent: bool,
    pub timeout: Duration,
    pub files: Vec<PathBuf>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            elevate: false,
            force_pty: false,
            forward_agent: false,
            timeout,
            files: Vec::new(),
        }
    }

    /// Elevation tools refuse to prompt without a controlling terminal.
    pub fn wants_pty(&self) -> bool {
        self.elevate || self.force_pty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
    Exit,
}

impl Stream {
    pub fn tag(self) -> &'static str {
        match self {
            Stream::Stdout => "out",
            Stream::Stderr => "err",
            Stream::Exit => "***",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub stream: Stream,
    pub data: Bytes,
}

impl OutputEvent {
    pub fn new(stream: Stream, data: impl Into<Bytes>) -> Self {
        Self {
            stream,
            data: data.into(),
        }
    }

    pub fn exit_notice(code: i32) -> Self {
        Self::new(Stream::Exit, format!("Exited with code: {code}\n"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connect,
    Staging,
    Protocol,
    Timeout,
}

/// Terminal value per host. A non-zero exit is still `Exited`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Exited { code: i32 },
    Failed { kind: FailureKind, message: String },
}

impl RunOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        RunOutcome::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            RunOutcome::Exited { .. } => None,
            RunOutcome::Failed { message, .. } => Some(message),
        }
    }
}
