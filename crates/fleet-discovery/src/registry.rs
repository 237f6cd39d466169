use std::future::Future;
use std::time::Duration;

use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::DiscoveryError;

/// Leader address tried when nothing else answers.
pub const DEFAULT_REGISTRY: &str = "http://leader.mesos:5050";
/// SRV record naming the current leader.
pub const LEADER_SRV: &str = "_leader._tcp.mesos.";

const GET_VERSION: &str = "GET_VERSION";
const GET_AGENTS: &str = "GET_AGENTS";

#[derive(Debug, Serialize)]
struct RegistryRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegistryResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    get_agents: Option<AgentsResponse>,
    #[serde(default)]
    get_version: Option<VersionResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentsResponse {
    #[serde(default)]
    pub agents: Vec<Agent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Agent {
    #[serde(default)]
    pub active: bool,
    pub agent_info: AgentInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionResponse {
    pub version_info: VersionInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

impl Agent {
    pub fn has_role(&self, role: &str) -> bool {
        self.agent_info
            .resources
            .iter()
            .any(|resource| resource.role.as_deref() == Some(role))
    }
}

/// Minimal client for the cluster leader's operator API.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    endpoint: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn get_version(&self) -> Result<VersionResponse, DiscoveryError> {
        self.request(GET_VERSION)
            .await?
            .get_version
            .ok_or_else(|| DiscoveryError::InvalidResponse("missing get_version".to_string()))
    }

    pub async fn get_agents(&self) -> Result<AgentsResponse, DiscoveryError> {
        self.request(GET_AGENTS)
            .await?
            .get_agents
            .ok_or_else(|| DiscoveryError::InvalidResponse("missing get_agents".to_string()))
    }

    async fn request(&self, kind: &str) -> Result<RegistryResponse, DiscoveryError> {
        let response = self
            .http
            .post(format!("{}/api/v1", self.endpoint))
            .json(&RegistryRequest { kind })
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        let decoded: RegistryResponse = serde_json::from_str(&body).map_err(|err| {
            DiscoveryError::InvalidResponse(format!("failed to parse response: {err}"))
        })?;
        if decoded.kind != kind {
            return Err(DiscoveryError::UnexpectedType {
                got: decoded.kind,
                wanted: kind.to_string(),
            });
        }
        Ok(decoded)
    }
}

/// Finds a leader that answers `GET_VERSION`: the configured endpoint, then
/// every target of the leader SRV record, then [`DEFAULT_REGISTRY`].
pub async fn discover_leader(
    configured: Option<&str>,
    timeout: Duration,
) -> Result<RegistryClient, DiscoveryError> {
    find_leader(configured, lookup_leader_srv(), timeout).await
}

/// Endpoints advertised by the [`LEADER_SRV`] record, in resolver order.
pub async fn lookup_leader_srv() -> Result<Vec<String>, DiscoveryError> {
    let srv_error = |source: ResolveError| DiscoveryError::Srv {
        name: LEADER_SRV.to_string(),
        source,
    };
    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(srv_error)?;
    let lookup = resolver.srv_lookup(LEADER_SRV).await.map_err(srv_error)?;
    Ok(lookup
        .iter()
        .map(|record| {
            let target = record.target().to_utf8();
            format!("http://{}:{}", target.trim_end_matches('.'), record.port())
        })
        .collect())
}

/// `srv` is only awaited once the configured endpoint has failed.
async fn find_leader<S>(
    configured: Option<&str>,
    srv: S,
    timeout: Duration,
) -> Result<RegistryClient, DiscoveryError>
where
    S: Future<Output = Result<Vec<String>, DiscoveryError>>,
{
    if let Some(endpoint) = configured.filter(|value| !value.trim().is_empty()) {
        if let Some(client) = check_leader(endpoint, timeout).await? {
            return Ok(client);
        }
        warn!(endpoint = %endpoint, "configured registry unreachable, trying autodiscovery");
    }

    match srv.await {
        Ok(endpoints) => {
            for endpoint in endpoints {
                if let Some(client) = check_leader(&endpoint, timeout).await? {
                    return Ok(client);
                }
            }
        }
        Err(err) => debug!(error = %err, "leader SRV lookup failed"),
    }

    let client = RegistryClient::new(DEFAULT_REGISTRY, timeout)?;
    match client.get_version().await {
        Ok(_) => Ok(client),
        Err(err) => Err(DiscoveryError::NoLeader(format!(
            "failed checking {DEFAULT_REGISTRY}: {err}"
        ))),
    }
}

async fn check_leader(
    endpoint: &str,
    timeout: Duration,
) -> Result<Option<RegistryClient>, DiscoveryError> {
    let client = RegistryClient::new(endpoint, timeout)?;
    match client.get_version().await {
        Ok(version) => {
            debug!(
                endpoint = %client.endpoint(),
                version = %version.version_info.version,
                "registry leader reachable"
            );
            Ok(Some(client))
        }
        Err(err) => {
            debug!(endpoint = %endpoint, error = %err, "registry candidate unreachable");
            Ok(None)
        }
    }
}

pub fn filter_agents<F>(agents: &AgentsResponse, predicate: F) -> Vec<String>
where
    F: Fn(&Agent) -> bool,
{
    agents
        .agents
        .iter()
        .filter(|agent| predicate(agent))
        .map(|agent| agent.agent_info.hostname.clone())
        .collect()
}
