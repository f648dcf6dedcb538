mod address;
mod buffer_pool;
mod config;
mod connection;
mod console;
mod relay;
mod server;
mod sniffer;
mod state;
mod traffic;

use crate::config::{Cli, ProxyConfig};
use crate::server::run_proxy;
use clap::Parser;
use color_eyre::eyre::Result;

use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("havoc=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();

    // Target is validated here, before anything is bound
    let config = ProxyConfig::from_cli(args)?;
    let interactive = config.interactive;
    let state = config.into_state();

    let chaos = state.chaos();
    info!(
        "Chaos: latency={} jitter={} drop_rate={:.2}",
        humantime::format_duration(chaos.latency),
        humantime::format_duration(chaos.jitter),
        chaos.drop_rate
    );

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    let control = async {
        if !interactive {
            return std::future::pending::<()>().await;
        }
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = console::run(&state, stdin, tokio::io::stdout()).await {
            warn!("Console stopped: {}", e);
        }
    };

    tokio::select! {
        result = run_proxy(state.clone()) => {
            result?;
            warn!("Server loop terminated");
        }
        _ = control => {
            info!("Console closed, stopping proxy");
        }
        _ = shutdown => {}
    }

    Ok(())
}
