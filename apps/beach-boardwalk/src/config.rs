use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;

const MEMORY_BROKER: &str = "memory://";

#[derive(Debug, Parser)]
#[command(
    name = "beach-boardwalk",
    author,
    version,
    about = "Room chat relay that fans messages out across instances via Redis pub/sub"
)]
pub struct Cli {
    /// Interface to bind the websocket listener to.
    #[arg(long, env = "BOARDWALK_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the websocket listener to.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Redis URL of the shared broker. `memory://` runs a single instance
    /// against an in-process bus.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Seconds between liveness sweeps.
    #[arg(
        long,
        env = "BOARDWALK_HEARTBEAT_INTERVAL_SECS",
        default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_secs()
    )]
    pub heartbeat_interval_secs: u64,

    /// Frames buffered per connection before fanout starts dropping.
    #[arg(long, env = "BOARDWALK_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BOARDWALK_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerTarget {
    Redis(String),
    Memory,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub broker: BrokerTarget,
    pub heartbeat_interval: Duration,
    pub outbound_buffer: usize,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let addr = format!("{}:{}", cli.host, cli.port);
        let listen_addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid listen address: {addr}"))?;

        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be greater than zero");
        }
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one frame");
        }

        let broker = if cli.redis_url == MEMORY_BROKER {
            BrokerTarget::Memory
        } else {
            BrokerTarget::Redis(cli.redis_url)
        };

        Ok(ServerConfig {
            listen_addr,
            broker,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            outbound_buffer: cli.outbound_buffer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

impl BrokerTarget {
    /// Printable form with any credentials in the URL masked.
    pub fn redacted(&self) -> String {
        match self {
            BrokerTarget::Memory => MEMORY_BROKER.to_string(),
            BrokerTarget::Redis(url) => match (url.find("://"), url.rfind('@')) {
                (Some(scheme), Some(at)) if at > scheme => {
                    format!("{}***{}", &url[..scheme + 3], &url[at..])
                }
                _ => url.clone(),
            },
        }
    }
}
