use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("invalid target selector: {0}")]
    InvalidSelector(String),

    #[error("http request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("invalid registry response: {0}")]
    InvalidResponse(String),

    #[error("unexpected response type '{got}', wanted '{wanted}'")]
    UnexpectedType { got: String, wanted: String },

    #[error("no registry leader reachable: {0}")]
    NoLeader(String),

    #[error("failed to look up SRV record {name}: {source}")]
    Srv {
        name: String,
        #[source]
        source: hickory_resolver::error::ResolveError,
    },

    #[error("failed to resolve {name}: {source}")]
    Resolve {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read host file {path}: {source}")]
    HostFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
