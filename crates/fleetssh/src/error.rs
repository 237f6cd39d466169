use std::time::Duration;

use fleet_protocol::{FailureKind, RunOutcome};
use thiserror::Error;

/// Why a host did not reach a clean exit status.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0:#}")]
    Connect(anyhow::Error),

    #[error("staging failed: {0:#}")]
    Staging(anyhow::Error),

    #[error("{0:#}")]
    Protocol(anyhow::Error),

    #[error("command terminated abnormally: {0}")]
    Abnormal(String),

    #[error("command timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("session is {state}, expected {expected}")]
    InvalidState {
        state: &'static str,
        expected: &'static str,
    },
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Connect(_) => FailureKind::Connect,
            SessionError::Staging(_) => FailureKind::Staging,
            SessionError::Timeout(_) => FailureKind::Timeout,
            SessionError::Protocol(_)
            | SessionError::Abnormal(_)
            | SessionError::InvalidState { .. } => FailureKind::Protocol,
        }
    }
}

impl From<SessionError> for RunOutcome {
    fn from(err: SessionError) -> Self {
        RunOutcome::failed(err.kind(), err.to_string())
    }
}
