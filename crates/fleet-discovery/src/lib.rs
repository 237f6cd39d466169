//! Resolves a target selector into the ordered list of hosts to fan out to.

use std::net::IpAddr;
use std::time::Duration;

use tracing::info;

mod errors;
mod hostfile;
mod registry;
mod selector;

pub use errors::DiscoveryError;
pub use hostfile::{parse_host_list, read_host_file};
pub use registry::{
    discover_leader, filter_agents, lookup_leader_srv, Agent, AgentsResponse, RegistryClient,
    DEFAULT_REGISTRY, LEADER_SRV,
};
pub use selector::TargetSelector;

pub const DEFAULT_MASTER_DNS: &str = "master.mesos";
pub const DEFAULT_PUBLIC_ROLE: &str = "slave_public";

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub registry: Option<String>,
    pub master_dns: String,
    pub public_role: String,
    pub request_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registry: None,
            master_dns: DEFAULT_MASTER_DNS.to_string(),
            public_role: DEFAULT_PUBLIC_ROLE.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub async fn discover(
    selector: &TargetSelector,
    config: &DiscoveryConfig,
) -> Result<Vec<String>, DiscoveryError> {
    let hosts = match selector {
        TargetSelector::Masters => lookup_masters(&config.master_dns).await?,
        TargetSelector::File(path) => read_host_file(path).await?,
        TargetSelector::Agents | TargetSelector::Public | TargetSelector::Private
        | TargetSelector::All => {
            let client =
                discover_leader(config.registry.as_deref(), config.request_timeout).await?;
            let agents = client.get_agents().await?;
            select_agents(selector, &agents, config).await?
        }
    };
    info!(selector = %selector, count = hosts.len(), "resolved hosts");
    Ok(hosts)
}

async fn select_agents(
    selector: &TargetSelector,
    agents: &AgentsResponse,
    config: &DiscoveryConfig,
) -> Result<Vec<String>, DiscoveryError> {
    let role = config.public_role.as_str();
    let hosts = match selector {
        TargetSelector::Public => filter_agents(agents, |agent| agent.has_role(role)),
        TargetSelector::Private => filter_agents(agents, |agent| !agent.has_role(role)),
        TargetSelector::All => {
            let mut hosts = filter_agents(agents, |_| true);
            hosts.extend(lookup_masters(&config.master_dns).await?);
            hosts
        }
        _ => filter_agents(agents, |_| true),
    };
    Ok(hosts)
}

/// Every address the master name resolves to, in resolver order, deduplicated.
pub async fn lookup_masters(name: &str) -> Result<Vec<String>, DiscoveryError> {
    let addrs = tokio::net::lookup_host((name, 0))
        .await
        .map_err(|source| DiscoveryError::Resolve {
            name: name.to_string(),
            source,
        })?;
    let mut seen: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !seen.contains(&addr.ip()) {
            seen.push(addr.ip());
        }
    }
    Ok(seen.into_iter().map(|ip| ip.to_string()).collect())
}
