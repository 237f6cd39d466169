//! Authentication material shared by every session of a run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::prompt::read_password;
use crate::transport::Connection;

const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

/// Tried in order when logging in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey(PathBuf),
    Agent,
    Password,
}

#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    pub key_file: Option<PathBuf>,
    pub password_file: Option<PathBuf>,
    /// Offer agent identities when logging in.
    pub use_agent: bool,
    /// Make the agent reachable from remote commands.
    pub forward_agent: bool,
    /// Offer (and if needed prompt for) a password.
    pub password: bool,
}

type PromptFn = Arc<dyn Fn() -> anyhow::Result<String> + Send + Sync>;

enum PasswordSource {
    Fixed(String),
    /// The outcome is cached either way; an aborted prompt is not retried.
    Prompt {
        cell: OnceCell<Result<String, String>>,
        prompt: PromptFn,
    },
    Unavailable,
}

pub struct Auth {
    methods: Vec<AuthMethod>,
    password: PasswordSource,
    agent_socket: Option<PathBuf>,
    forward_agent: bool,
}

impl Auth {
    pub fn from_options(options: &AuthOptions) -> anyhow::Result<Self> {
        let mut methods = Vec::new();

        if let Some(key_file) = options.key_file.as_ref() {
            std::fs::metadata(key_file)
                .with_context(|| format!("failed to read key file {}", key_file.display()))?;
            methods.push(AuthMethod::PublicKey(key_file.clone()));
        }

        let mut agent_socket = None;
        if options.use_agent || options.forward_agent {
            if let Some(socket) = std::env::var_os(AGENT_SOCKET_ENV).map(PathBuf::from) {
                check_agent_socket(&socket)?;
                if options.use_agent {
                    methods.push(AuthMethod::Agent);
                }
                agent_socket = Some(socket);
            }
        }

        let password = if let Some(path) = options.password_file.as_ref() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read password file {}", path.display()))?;
            methods.push(AuthMethod::Password);
            PasswordSource::Fixed(raw.trim().to_string())
        } else if options.password {
            methods.push(AuthMethod::Password);
            PasswordSource::Prompt {
                cell: OnceCell::new(),
                prompt: Arc::new(|| read_password("Password:")),
            }
        } else {
            PasswordSource::Unavailable
        };

        Ok(Self {
            methods,
            password,
            agent_socket,
            forward_agent: options.forward_agent,
        })
    }

    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            methods: vec![AuthMethod::Password],
            password: PasswordSource::Fixed(password.into()),
            agent_socket: None,
            forward_agent: false,
        }
    }

    pub fn with_prompt<F>(prompt: F) -> Self
    where
        F: Fn() -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            methods: vec![AuthMethod::Password],
            password: PasswordSource::Prompt {
                cell: OnceCell::new(),
                prompt: Arc::new(prompt),
            },
            agent_socket: None,
            forward_agent: false,
        }
    }

    /// Offers `key_file` before any other method.
    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.methods.insert(0, AuthMethod::PublicKey(key_file.into()));
        self
    }

    /// Forwards the agent at `socket` to remote commands.
    pub fn with_agent_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.agent_socket = Some(socket.into());
        self.forward_agent = true;
        self
    }

    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods
    }

    pub fn has_password(&self) -> bool {
        !matches!(self.password, PasswordSource::Unavailable)
    }

    /// Whether any key-based method (key file or agent) is configured.
    pub fn has_key_methods(&self) -> bool {
        self.methods
            .iter()
            .any(|method| !matches!(method, AuthMethod::Password))
    }

    /// The agent socket remote commands should reach, when forwarding is on.
    pub fn forwarded_agent(&self) -> Option<&Path> {
        if self.forward_agent {
            self.agent_socket.as_deref()
        } else {
            None
        }
    }

    /// The first caller prompts; everyone, the first included, gets the
    /// cached result, failures included.
    pub async fn password(&self) -> anyhow::Result<String> {
        match &self.password {
            PasswordSource::Fixed(password) => Ok(password.clone()),
            PasswordSource::Prompt { cell, prompt } => {
                let cached = cell
                    .get_or_init(|| async {
                        let prompt = Arc::clone(prompt);
                        let read = match tokio::task::spawn_blocking(move || (*prompt)()).await {
                            Ok(read) => read,
                            Err(err) => {
                                Err(anyhow::Error::new(err).context("password prompt task failed"))
                            }
                        };
                        match read {
                            Ok(password) => {
                                debug!(length = password.len(), "read password");
                                Ok(password)
                            }
                            Err(err) => {
                                debug!(error = %err, "password prompt failed");
                                Err(format!("{err:#}"))
                            }
                        }
                    })
                    .await;
                cached.clone().map_err(|message| anyhow::anyhow!(message))
            }
            PasswordSource::Unavailable => anyhow::bail!("no password available"),
        }
    }

    /// Arms agent forwarding on `connection`.
    pub fn forward_agent(&self, connection: &dyn Connection) -> anyhow::Result<()> {
        match self.forwarded_agent() {
            Some(socket) => connection.enable_agent_forwarding(socket),
            None => anyhow::bail!("no agent available"),
        }
    }
}

#[cfg(unix)]
fn check_agent_socket(socket: &Path) -> anyhow::Result<()> {
    std::os::unix::net::UnixStream::connect(socket)
        .with_context(|| format!("failed to reach agent at {}", socket.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn check_agent_socket(_socket: &Path) -> anyhow::Result<()> {
    Ok(())
}
