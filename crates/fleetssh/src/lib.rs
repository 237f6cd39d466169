mod auth;
pub mod cli;
mod collector;
pub mod config;
mod error;
mod logging;
mod prompt;
mod scheduler;
mod session;
mod sink;
mod transport;

pub use auth::{Auth, AuthMethod, AuthOptions};
pub use collector::{
    collector_for, BatchedCollector, Collector, HostReport, InterleavedCollector, DEFAULT_GRACE,
};
pub use error::SessionError;
pub use logging::init_tracing;
pub use scheduler::{RunSummary, Scheduler};
pub use session::{Session, SessionState};
pub use sink::{remote_sink, EventSender, RemoteSink, RemoteSource};
pub use transport::{
    run_capture, Captured, Channel, ChannelExit, ChannelRequest, Connection, OpenSshTransport,
    SshOptions, Transport,
};
