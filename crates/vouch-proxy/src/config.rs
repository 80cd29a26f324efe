//! Daemon command-line configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// vouch-proxy - safety interceptor for AI-agent tool traffic
#[derive(Parser, Debug, Clone)]
#[command(name = "vouch-proxy")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address the proxy listens on for agent traffic
    #[arg(long, default_value = "127.0.0.1:9999")]
    pub listen: SocketAddr,

    /// Address of the localhost control API (approve/reject/rekey)
    #[arg(long, default_value = "127.0.0.1:9998")]
    pub control: SocketAddr,

    /// Upstream base URL tool traffic is forwarded to
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub upstream: String,

    /// Path to the ledger database
    #[arg(long, default_value = "vouch.db")]
    pub db: PathBuf,

    /// Path to the signing key file
    #[arg(long, default_value = ".vouch_key")]
    pub key_file: PathBuf,

    /// Path to the policy file
    #[arg(long, default_value = "vouch-policy.yaml")]
    pub policy: PathBuf,

    /// Bound of the ledger event queue
    #[arg(long, default_value = "1000")]
    pub queue_capacity: usize,

    /// Stall deadline in seconds; stalls wait indefinitely when unset
    #[arg(long)]
    pub stall_timeout_secs: Option<u64>,

    /// Upstream forwarding timeout in seconds
    #[arg(long, default_value = "30")]
    pub upstream_timeout_secs: u64,

    /// Agent label recorded in the run metadata
    #[arg(long, default_value = "default-agent")]
    pub agent: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
