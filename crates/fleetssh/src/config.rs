//! Run settings: command-line flags over `~/.fleetssh/config.toml` over
//! built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use fleet_discovery::{DiscoveryConfig, TargetSelector, DEFAULT_MASTER_DNS, DEFAULT_PUBLIC_ROLE};
use fleet_protocol::CommandSpec;
use serde::Deserialize;

use crate::auth::AuthOptions;
use crate::cli::Args;
use crate::collector::DEFAULT_GRACE;
use crate::transport::SshOptions;

pub const DEFAULT_CONFIG_PATH: &str = "~/.fleetssh/config.toml";
const DEFAULT_CONTROL_DIR: &str = "~/.fleetssh/control";
const DEFAULT_PARALLEL: usize = 4;
const DEFAULT_PORT: u16 = 22;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub parallel: Option<usize>,
    pub timeout: Option<String>,
    pub grace_ms: Option<u64>,
    pub registry: Option<String>,
    pub key_file: Option<String>,
    pub password_file: Option<String>,
    pub ssh_args: Option<Vec<String>>,
    pub ssh_args_line: Option<String>,
    pub control_dir: Option<String>,
    pub master_dns: Option<String>,
    pub public_role: Option<String>,
}

/// Everything one invocation needs, fully resolved.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: TargetSelector,
    pub command: CommandSpec,
    pub parallel: usize,
    pub grace: Duration,
    pub interleave: bool,
    pub ssh: SshOptions,
    pub auth: AuthOptions,
    pub discovery: DiscoveryConfig,
}

/// Reads the config file. The default location may be absent; an explicit
/// `--config` must exist.
pub fn load_config_file(explicit: Option<&Path>) -> anyhow::Result<ConfigFile> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (expand_tilde(DEFAULT_CONFIG_PATH), false),
    };
    if !required && !path.exists() {
        return Ok(ConfigFile::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn parse_config(raw: &str) -> anyhow::Result<ConfigFile> {
    Ok(toml::from_str(raw)?)
}

pub fn resolve(args: &Args, file: ConfigFile) -> anyhow::Result<RunConfig> {
    let defaults = file.defaults;

    let user = args
        .user
        .clone()
        .or(defaults.user)
        .or_else(current_user)
        .unwrap_or_default();
    if user.trim().is_empty() {
        anyhow::bail!("remote user must not be empty (set --user)");
    }

    let parallel = args
        .parallel
        .or(defaults.parallel)
        .unwrap_or(DEFAULT_PARALLEL);
    if parallel == 0 {
        anyhow::bail!("parallel must be at least 1");
    }

    let timeout = match (args.timeout, defaults.timeout.as_deref()) {
        (Some(timeout), _) => timeout,
        (None, Some(raw)) => humantime::parse_duration(raw)
            .with_context(|| format!("invalid timeout {raw:?}"))?,
        (None, None) => DEFAULT_TIMEOUT,
    };
    if timeout.is_zero() {
        anyhow::bail!("timeout must be greater than zero");
    }

    let ssh_args = match (defaults.ssh_args, defaults.ssh_args_line) {
        (Some(_), Some(_)) => anyhow::bail!("set only one of ssh_args and ssh_args_line"),
        (Some(args), None) => args,
        (None, Some(line)) => shell_words::split(&line)
            .with_context(|| format!("invalid ssh_args_line {line:?}"))?,
        (None, None) => Vec::new(),
    };

    let command_line = args.command_line();
    if command_line.trim().is_empty() {
        anyhow::bail!("command must not be empty");
    }
    let mut command = CommandSpec::new(command_line, timeout);
    command.elevate = args.sudo;
    command.force_pty = args.pty;
    command.forward_agent = args.forward_agent;
    command.files = args.files.clone();

    let target = TargetSelector::parse(&args.target)?;

    let auth = AuthOptions {
        key_file: args
            .key_file
            .clone()
            .or_else(|| defaults.key_file.as_deref().map(expand_tilde)),
        password_file: args
            .password_file
            .clone()
            .or_else(|| defaults.password_file.as_deref().map(expand_tilde)),
        use_agent: !args.no_agent,
        forward_agent: args.forward_agent,
        password: !args.no_password,
    };

    let ssh = SshOptions {
        user,
        port: args.port.or(defaults.port).unwrap_or(DEFAULT_PORT),
        ssh_args,
        control_dir: expand_tilde(
            defaults
                .control_dir
                .as_deref()
                .unwrap_or(DEFAULT_CONTROL_DIR),
        ),
        connect_timeout: CONNECT_TIMEOUT,
    };

    let discovery = DiscoveryConfig {
        registry: args.mesos.clone().or(defaults.registry),
        master_dns: defaults
            .master_dns
            .unwrap_or_else(|| DEFAULT_MASTER_DNS.to_string()),
        public_role: defaults
            .public_role
            .unwrap_or_else(|| DEFAULT_PUBLIC_ROLE.to_string()),
        request_timeout: REGISTRY_TIMEOUT,
    };

    Ok(RunConfig {
        target,
        command,
        parallel,
        grace: defaults
            .grace_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE),
        interleave: args.interleave,
        ssh,
        auth,
        discovery,
    })
}

fn current_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|user| !user.trim().is_empty())
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
