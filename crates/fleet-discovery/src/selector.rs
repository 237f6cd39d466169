use std::fmt;
use std::path::PathBuf;

use crate::errors::DiscoveryError;

/// Symbolic target class given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Masters,
    Agents,
    Public,
    Private,
    All,
    /// Anything that is not a known keyword names a file of addresses.
    File(PathBuf),
}

impl TargetSelector {
    pub fn parse(raw: &str) -> Result<Self, DiscoveryError> {
        let raw = raw.trim();
        let selector = match raw {
            "" => return Err(DiscoveryError::InvalidSelector("empty selector".to_string())),
            "masters" => TargetSelector::Masters,
            "agents" => TargetSelector::Agents,
            "public" => TargetSelector::Public,
            "private" => TargetSelector::Private,
            "all" => TargetSelector::All,
            path => TargetSelector::File(PathBuf::from(path)),
        };
        Ok(selector)
    }

    pub fn needs_registry(&self) -> bool {
        matches!(
            self,
            TargetSelector::Agents
                | TargetSelector::Public
                | TargetSelector::Private
                | TargetSelector::All
        )
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Masters => f.write_str("masters"),
            TargetSelector::Agents => f.write_str("agents"),
            TargetSelector::Public => f.write_str("public"),
            TargetSelector::Private => f.write_str("private"),
            TargetSelector::All => f.write_str("all"),
            TargetSelector::File(path) => write!(f, "{}", path.display()),
        }
    }
}
