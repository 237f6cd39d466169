//! Turns per-host event streams into what the user sees.
//!
//! Every host registered with [`Collector::new_remote`] gets one worker task
//! that drains its [`RemoteSource`]: events until the terminal outcome
//! arrives, then a grace window that absorbs output racing behind it. The
//! window restarts on every event and closes after one quiet period; the
//! source is dropped afterwards so late producers see a closed channel.

mod batched;
mod interleaved;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use fleet_protocol::{FailureKind, Host, OutputEvent, RunOutcome};
use tokio::io::AsyncWrite;

use crate::sink::{RemoteSink, RemoteSource};

pub use batched::{BatchedCollector, HostReport};
pub use interleaved::InterleavedCollector;

pub const DEFAULT_GRACE: Duration = Duration::from_millis(100);

#[async_trait]
pub trait Collector: Send {
    /// Registers `host` and returns the sink its session writes into.
    fn new_remote(&mut self, host: &Host) -> RemoteSink;

    /// Writes all registered hosts' output to `out`, returning once every one
    /// of them has finished.
    async fn read(&mut self, out: &mut (dyn AsyncWrite + Unpin + Send)) -> io::Result<()>;
}

/// Picks the presentation once at startup.
pub fn collector_for(interleave: bool, grace: Duration) -> Box<dyn Collector> {
    if interleave {
        Box::new(InterleavedCollector::new(grace))
    } else {
        Box::new(BatchedCollector::new(grace))
    }
}

/// One host's events in arrival order, followed by the grace drain.
pub(crate) struct HostFeed {
    source: RemoteSource,
    grace: Duration,
    outcome: Option<RunOutcome>,
    events_open: bool,
}

impl HostFeed {
    pub(crate) fn new(source: RemoteSource, grace: Duration) -> Self {
        Self {
            source,
            grace,
            outcome: None,
            events_open: true,
        }
    }

    pub(crate) fn host(&self) -> &Host {
        &self.source.host
    }

    /// Next event, or `None` once the outcome is in and the grace window has
    /// closed.
    pub(crate) async fn next_event(&mut self) -> Option<OutputEvent> {
        while self.outcome.is_none() {
            tokio::select! {
                biased;
                event = self.source.events.recv(), if self.events_open => match event {
                    Some(event) => return Some(event),
                    None => self.events_open = false,
                },
                outcome = &mut self.source.done => {
                    self.outcome = Some(outcome.unwrap_or_else(|_| lost_outcome()));
                }
            }
        }
        if !self.events_open {
            return None;
        }
        match tokio::time::timeout(self.grace, self.source.events.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) | Err(_) => {
                self.events_open = false;
                None
            }
        }
    }

    pub(crate) fn finish(self) -> RunOutcome {
        self.outcome.unwrap_or_else(lost_outcome)
    }
}

fn lost_outcome() -> RunOutcome {
    RunOutcome::failed(
        FailureKind::Protocol,
        "session ended without reporting an outcome",
    )
}
