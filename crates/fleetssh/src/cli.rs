use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "fleetssh",
    version,
    about = "Run one command over SSH on many cluster hosts"
)]
pub struct Args {
    /// masters, agents, public, private, all, or a file with one host per line
    pub target: String,
    /// Command to run; words are joined with spaces
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// How many sessions to run in parallel
    #[arg(short = 'm', long)]
    pub parallel: Option<usize>,
    /// Remote username
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Run the command as superuser on the remote host (implies --pty)
    #[arg(long)]
    pub sudo: bool,
    #[arg(long)]
    pub pty: bool,
    /// Local file copied next to the command before it runs; repeatable
    #[arg(short = 'f', long = "file")]
    pub files: Vec<PathBuf>,
    /// Per-host command timeout, e.g. 90s or 5m
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
    /// Print output live, one prefixed line at a time
    #[arg(long)]
    pub interleave: bool,
    /// Make the local SSH agent reachable from the remote command
    #[arg(short = 'A', long)]
    pub forward_agent: bool,
    /// Do not offer agent identities when logging in
    #[arg(long)]
    pub no_agent: bool,
    #[arg(short = 'i', long)]
    pub key_file: Option<PathBuf>,
    #[arg(long)]
    pub password_file: Option<PathBuf>,
    /// Never prompt for a password
    #[arg(long)]
    pub no_password: bool,
    /// Registry (cluster leader) address
    #[arg(long)]
    pub mesos: Option<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub debug: bool,
    /// Also write JSON logs to a daily file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Args {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}
