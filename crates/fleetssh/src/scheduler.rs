//! Fans one command out over many hosts with at most `parallel` in flight.

use std::sync::Arc;

use anyhow::Context;
use fleet_protocol::{CommandSpec, FailureKind, Host, RunOutcome};
use tokio::io::AsyncWrite;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::Auth;
use crate::collector::Collector;
use crate::session::Session;
use crate::sink::RemoteSink;
use crate::transport::Transport;

/// Tally of host outcomes for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub hosts: usize,
    pub exited_zero: usize,
    pub exited_nonzero: usize,
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &RunOutcome) {
        self.hosts += 1;
        match outcome {
            RunOutcome::Exited { code: 0 } => self.exited_zero += 1,
            RunOutcome::Exited { .. } => self.exited_nonzero += 1,
            RunOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

pub struct Scheduler {
    transport: Arc<dyn Transport>,
    auth: Arc<Auth>,
    parallel: usize,
}

impl Scheduler {
    pub fn new(transport: Arc<dyn Transport>, auth: Arc<Auth>, parallel: usize) -> Self {
        Self {
            transport,
            auth,
            parallel,
        }
    }

    /// Runs `spec` on every host and writes the collected output to `out`.
    /// Host failures are reported through the collector, never as an error here.
    pub async fn run(
        &self,
        hosts: Vec<Host>,
        spec: Arc<CommandSpec>,
        mut collector: Box<dyn Collector>,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> anyhow::Result<RunSummary> {
        if hosts.is_empty() {
            anyhow::bail!("no hosts to run on");
        }
        if self.parallel == 0 {
            anyhow::bail!("parallel must be at least 1");
        }

        // Starts empty so no host is admitted before all of them are queued.
        let permits = Arc::new(Semaphore::new(0));
        let mut tasks = JoinSet::new();
        for host in hosts {
            let sink = collector.new_remote(&host);
            let session = Session::new(
                host,
                Arc::clone(&self.transport),
                Arc::clone(&self.auth),
                sink.events(),
            );
            tasks.spawn(run_host(
                session,
                sink,
                Arc::clone(&spec),
                Arc::clone(&permits),
            ));
        }
        debug!(hosts = tasks.len(), parallel = self.parallel, "dispatched hosts");
        permits.add_permits(self.parallel);

        collector
            .read(out)
            .await
            .context("failed to write command output")?;

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    warn!(error = %err, "host task failed");
                    summary.record(&RunOutcome::failed(FailureKind::Protocol, err.to_string()));
                }
            }
        }
        info!(
            hosts = summary.hosts,
            exited_zero = summary.exited_zero,
            exited_nonzero = summary.exited_nonzero,
            failed = summary.failed,
            "run finished"
        );
        Ok(summary)
    }
}

async fn run_host(
    mut session: Session,
    sink: RemoteSink,
    spec: Arc<CommandSpec>,
    permits: Arc<Semaphore>,
) -> RunOutcome {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            let outcome = RunOutcome::failed(FailureKind::Protocol, "admission pool closed");
            sink.done(outcome.clone());
            return outcome;
        }
    };

    let outcome = match session.connect().await {
        Ok(()) => match session.run(&spec).await {
            Ok(code) => RunOutcome::Exited { code },
            Err(err) => RunOutcome::from(err),
        },
        Err(err) => {
            warn!(host = %session.host(), error = %err, "connect failed");
            RunOutcome::from(err)
        }
    };
    sink.done(outcome.clone());
    session.close().await;
    outcome
}
