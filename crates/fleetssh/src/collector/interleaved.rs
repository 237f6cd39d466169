use std::io;
use std::time::Duration;

use async_trait::async_trait;
use fleet_protocol::{Host, OutputEvent, Stream};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{Collector, HostFeed};
use crate::sink::{remote_sink, RemoteSink};

const LINE_BUFFER: usize = 256;

/// Splits one host's events into complete, tagged lines.
#[derive(Debug)]
pub(crate) struct LineAssembler {
    host: Host,
    current: Option<Stream>,
    partial: Vec<u8>,
}

impl LineAssembler {
    pub(crate) fn new(host: Host) -> Self {
        Self {
            host,
            current: None,
            partial: Vec::new(),
        }
    }

    /// Lines completed by `event`. A stream switch first flushes the partial
    /// line of the previous stream.
    pub(crate) fn push(&mut self, event: &OutputEvent) -> Vec<String> {
        let mut lines = Vec::new();
        if self.current != Some(event.stream) {
            lines.extend(self.flush());
            self.current = Some(event.stream);
        }
        let mut rest = &event.data[..];
        while let Some(newline) = rest.iter().position(|byte| *byte == b'\n') {
            self.partial.extend_from_slice(&rest[..newline]);
            lines.push(self.take_line());
            rest = &rest[newline + 1..];
        }
        self.partial.extend_from_slice(rest);
        lines
    }

    pub(crate) fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let tag = self.current.unwrap_or(Stream::Stdout).tag();
        let text = String::from_utf8_lossy(&self.partial);
        let line = format!(
            "{} [{}]: {}",
            self.host,
            tag,
            text.strip_suffix('\r').unwrap_or(&*text)
        );
        self.partial.clear();
        line
    }
}

/// Prints every host's output live, one prefixed line at a time.
pub struct InterleavedCollector {
    grace: Duration,
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

impl InterleavedCollector {
    pub fn new(grace: Duration) -> Self {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        Self {
            grace,
            tx: Some(tx),
            rx,
        }
    }

    fn line_sender(&mut self) -> mpsc::Sender<String> {
        if let Some(tx) = self.tx.as_ref() {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        self.rx = rx;
        self.tx = Some(tx.clone());
        tx
    }
}

#[async_trait]
impl Collector for InterleavedCollector {
    fn new_remote(&mut self, host: &Host) -> RemoteSink {
        let (sink, source) = remote_sink(host.clone());
        let mut feed = HostFeed::new(source, self.grace);
        let tx = self.line_sender();
        let mut assembler = LineAssembler::new(host.clone());
        tokio::spawn(async move {
            while let Some(event) = feed.next_event().await {
                for line in assembler.push(&event) {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            let outcome = feed.finish();
            let mut tail = Vec::new();
            if let Some(message) = outcome.error_message() {
                let failure = OutputEvent::new(Stream::Exit, format!("Failed with {message}\n"));
                tail.extend(assembler.push(&failure));
            }
            tail.extend(assembler.flush());
            for line in tail {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
        });
        sink
    }

    async fn read(&mut self, out: &mut (dyn AsyncWrite + Unpin + Send)) -> io::Result<()> {
        drop(self.tx.take());
        while let Some(line) = self.rx.recv().await {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await?;
        }
        Ok(())
    }
}
