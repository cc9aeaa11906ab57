//! Nest device gateway.
//!
//! ```text
//!   Thermostat ──▶ http (handlers) ──▶ security (admission) ──▶ proxy (engine) ──▶ Upstream
//!   Thermostat ◀── http (response) ◀── proxy (codec, subscription relay) ◀──────── Upstream
//!
//!   Cross-cutting: config (hot reload), observability, lifecycle
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use nest_proxy::config::{load_config, watcher::ConfigWatcher, ProxyConfig};
use nest_proxy::observability::{logging, metrics};
use nest_proxy::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "nest-proxy")]
#[command(about = "Reverse proxy for Nest thermostat device traffic", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/nest-proxy.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let file_exists = cli.config.exists();
    let config = if file_exists {
        load_config(&cli.config)?
    } else {
        ProxyConfig::default()
    };

    if cli.check {
        println!("{}: configuration is valid", cli.config.display());
        return Ok(());
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "nest-proxy starting");

    if !file_exists {
        tracing::warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.proxy.upstream_base_url,
        enabled = config.proxy.enabled,
        rate_limit = config.rate_limit.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Invalid metrics address"
            ),
        }
    }

    // Without a file there is nothing to watch; updates never arrive.
    let (_watcher, config_updates) = if file_exists {
        let (watcher, updates) = ConfigWatcher::new(&cli.config, config.clone());
        (Some(watcher.run()?), updates)
    } else {
        let (_, updates) = mpsc::unbounded_channel();
        (None, updates)
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for devices");

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    let server = HttpServer::new(config)?;
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
