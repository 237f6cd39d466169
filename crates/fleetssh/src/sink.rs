//! Per-host channel pair between a session (producer) and a collector worker.
//!
//! Byte events and the terminal outcome travel on separate channels so the
//! consumer can wait on "more bytes" and "finished" at once without the outcome
//! queueing behind a backlog of output.

use bytes::Bytes;
use fleet_protocol::{Host, OutputEvent, RunOutcome, Stream};
use tokio::sync::{mpsc, oneshot};

const EVENT_BUFFER: usize = 64;

/// Producer half. Dropping the last [`EventSender`] and calling [`RemoteSink::done`]
/// are the only ways the consumer learns the host is finished.
pub struct RemoteSink {
    host: Host,
    events: EventSender,
    done: oneshot::Sender<RunOutcome>,
}

/// Consumer half, owned by exactly one collector worker.
pub struct RemoteSource {
    pub host: Host,
    pub events: mpsc::Receiver<OutputEvent>,
    pub done: oneshot::Receiver<RunOutcome>,
}

/// Cloneable handle the relay tasks use to enqueue output.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<OutputEvent>,
}

pub fn remote_sink(host: Host) -> (RemoteSink, RemoteSource) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (done_tx, done_rx) = oneshot::channel();
    let sink = RemoteSink {
        host: host.clone(),
        events: EventSender { tx: events_tx },
        done: done_tx,
    };
    let source = RemoteSource {
        host,
        events: events_rx,
        done: done_rx,
    };
    (sink, source)
}

impl RemoteSink {
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub async fn stdout(&self, data: impl Into<Bytes>) -> bool {
        self.events.send(Stream::Stdout, data).await
    }

    pub async fn stderr(&self, data: impl Into<Bytes>) -> bool {
        self.events.send(Stream::Stderr, data).await
    }

    pub async fn exit(&self, code: i32) -> bool {
        self.events.exit(code).await
    }

    /// Signals the terminal outcome. Consumes the sink, so it can happen once.
    pub fn done(self, outcome: RunOutcome) {
        if self.done.send(outcome).is_err() {
            tracing::debug!(host = %self.host, "collector gone before outcome was delivered");
        }
    }
}

impl EventSender {
    /// Returns false once the consumer has stopped listening.
    pub async fn send(&self, stream: Stream, data: impl Into<Bytes>) -> bool {
        self.tx.send(OutputEvent::new(stream, data)).await.is_ok()
    }

    pub async fn exit(&self, code: i32) -> bool {
        self.tx.send(OutputEvent::exit_notice(code)).await.is_ok()
    }
}
