//! CLI arguments and the resolved server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::error::ServerError;

/// Default TCP port the gateway listens on.
pub const DEFAULT_PORT: u16 = 3002;

/// Command-line arguments for the `rsu-server` binary.
#[derive(Debug, Parser)]
#[command(name = "rsu-server", about = "RSU device gateway daemon")]
pub struct Args {
    /// Address to bind for incoming RSU device connections.
    #[arg(long, default_value_t = default_listen_addr())]
    pub bind: SocketAddr,

    /// Heartbeat interval, in seconds.
    #[arg(long, default_value_t = rsu_core::DEFAULT_HEARTBEAT_SECS)]
    pub heartbeat_secs: u64,

    /// Disable BCC checksum verification on inbound frames.
    #[arg(long)]
    pub no_verify_bcc: bool,

    /// Maximum simultaneous connections. Unbounded if omitted.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log filter, in `tracing-subscriber` `EnvFilter` syntax.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

/// Resolved, validated configuration the daemon runs with.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind for incoming connections.
    pub listen_addr: SocketAddr,
    /// Heartbeat interval applied to new sessions.
    pub heartbeat_interval: Duration,
    /// Whether to verify the BCC checksum on inbound frames.
    pub verify_bcc: bool,
    /// Maximum simultaneous connections, if bounded.
    pub max_connections: Option<usize>,
}

impl TryFrom<&Args> for ServerConfig {
    type Error = ServerError;

    fn try_from(args: &Args) -> Result<Self, Self::Error> {
        if args.heartbeat_secs == 0 {
            return Err(ServerError::Config("heartbeat_secs must be greater than zero".to_string()));
        }

        Ok(Self {
            listen_addr: args.bind,
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            verify_bcc: !args.no_verify_bcc,
            max_connections: args.max_connections,
        })
    }
}
