use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::address::parse_target_address;
use crate::state::HavocState;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "TCP proxy that simulates a bad network",
    long_about = "havoc sits between a client and a target server and degrades the path between them.\n\nEvery chunk relayed in either direction can be delayed (latency + random jitter) or dropped entirely. \
HTTP request lines and status codes are sniffed from the stream and logged once per connection.\n\nWith --interactive the chaos settings can be changed from stdin while traffic is flowing.\n"
)]
pub struct Cli {
    /// Port to listen on; the next free port is used if it is taken
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// IP address to bind the listener to
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Target server: port, :port, host:port or URL
    #[arg(short, long, value_name = "TARGET")]
    pub target: String,

    /// Read chaos commands from stdin while proxying
    #[arg(short, long)]
    pub interactive: bool,

    /// Base latency added to every chunk (e.g. 100ms, 1s)
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub latency: Duration,

    /// Random latency variance added on top of --latency (e.g. 50ms)
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub jitter: Duration,

    /// Probability in [0, 1] that a chunk is dropped
    #[arg(short, long, default_value_t = 0.0)]
    pub drop_rate: f64,

    /// Seed for reproducible drop and jitter decisions
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Proxy configuration derived from CLI arguments
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyConfig {
    pub listen_ip: IpAddr,
    pub port: u16,
    pub target: String,
    pub interactive: bool,
    pub latency: Duration,
    pub jitter: Duration,
    pub drop_rate: f64,
    pub seed: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            target: "localhost:8080".to_string(),
            interactive: false,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            drop_rate: 0.0,
            seed: None,
        }
    }
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments, normalizing the target
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let target = parse_target_address(&args.target)
            .map_err(|e| color_eyre::eyre::eyre!("Invalid --target {:?}: {}", args.target, e))?;

        Ok(Self {
            listen_ip: args.listen_ip,
            port: args.port,
            target,
            interactive: args.interactive,
            latency: args.latency,
            jitter: args.jitter,
            drop_rate: args.drop_rate,
            seed: args.seed,
        })
    }

    /// Build the shared runtime state; chaos values go through the clamping setters
    pub fn into_state(self) -> Arc<HavocState> {
        let state = match self.seed {
            Some(seed) => HavocState::with_seed(seed),
            None => HavocState::new(),
        };
        state.set_listen_ip(self.listen_ip);
        state.set_port(self.port);
        state.set_target(self.target);
        state.set_latency(self.latency);
        state.set_jitter(self.jitter);
        state.set_drop_rate(self.drop_rate);
        Arc::new(state)
    }
}
