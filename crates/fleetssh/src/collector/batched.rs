use std::io;
use std::time::Duration;

use async_trait::async_trait;
use fleet_protocol::{Host, OutputEvent, RunOutcome};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Collector, HostFeed};
use crate::sink::{remote_sink, RemoteSink};

const REPORT_BUFFER: usize = 16;

/// Everything one host produced, delivered once it is finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub host: Host,
    pub events: Vec<OutputEvent>,
    pub outcome: RunOutcome,
}

impl HostReport {
    pub fn render(&self) -> Vec<u8> {
        let mut out = format!("\n===== Results from {}\n", self.host).into_bytes();
        for event in &self.events {
            out.extend_from_slice(&event.data);
        }
        if let Some(message) = self.outcome.error_message() {
            out.extend_from_slice(format!("==> Failed with {message}\n").as_bytes());
        }
        out
    }
}

/// Holds each host's output until it finishes, then prints it as one block.
/// Blocks appear in completion order.
pub struct BatchedCollector {
    grace: Duration,
    hosts: usize,
    tx: mpsc::Sender<HostReport>,
    rx: mpsc::Receiver<HostReport>,
}

impl BatchedCollector {
    pub fn new(grace: Duration) -> Self {
        let (tx, rx) = mpsc::channel(REPORT_BUFFER);
        Self {
            grace,
            hosts: 0,
            tx,
            rx,
        }
    }
}

#[async_trait]
impl Collector for BatchedCollector {
    fn new_remote(&mut self, host: &Host) -> RemoteSink {
        let (sink, source) = remote_sink(host.clone());
        let mut feed = HostFeed::new(source, self.grace);
        let tx = self.tx.clone();
        self.hosts += 1;
        tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = feed.next_event().await {
                events.push(event);
            }
            let host = feed.host().clone();
            let report = HostReport {
                host,
                events,
                outcome: feed.finish(),
            };
            if tx.send(report).await.is_err() {
                debug!("batched reader gone, dropping report");
            }
        });
        sink
    }

    async fn read(&mut self, out: &mut (dyn AsyncWrite + Unpin + Send)) -> io::Result<()> {
        let expected = std::mem::take(&mut self.hosts);
        for _ in 0..expected {
            let Some(report) = self.rx.recv().await else {
                break;
            };
            out.write_all(&report.render()).await?;
            out.flush().await?;
        }
        Ok(())
    }
}
