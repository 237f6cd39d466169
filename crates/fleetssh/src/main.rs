use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fleet_protocol::Host;
use fleetssh::cli::Args;
use fleetssh::config::{load_config_file, resolve};
use fleetssh::{collector_for, init_tracing, Auth, OpenSshTransport, Scheduler};
use tracing::debug;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.debug, args.log_dir.as_deref())?;

    let file = load_config_file(args.config.as_deref())?;
    let config = resolve(&args, file)?;

    let hosts = fleet_discovery::discover(&config.target, &config.discovery)
        .await
        .with_context(|| format!("failed to find hosts for {}", config.target))?;
    if hosts.is_empty() {
        anyhow::bail!("no hosts found for {}", config.target);
    }
    debug!(hosts = %hosts.join(", "), "found hosts");
    let hosts: Vec<Host> = hosts.into_iter().map(Host::from).collect();

    let auth = Arc::new(Auth::from_options(&config.auth)?);
    let transport = OpenSshTransport::new(config.ssh.clone(), Arc::clone(&auth))?;
    let collector = collector_for(config.interleave, config.grace);
    let scheduler = Scheduler::new(Arc::new(transport), auth, config.parallel);

    let mut stdout = tokio::io::stdout();
    scheduler
        .run(hosts, Arc::new(config.command), collector, &mut stdout)
        .await?;
    Ok(())
}
