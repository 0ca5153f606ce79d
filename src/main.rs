//! Admission control server.
//!
//! Runs the demo application behind the admission chain:
//!
//! ```text
//!   client ──▶ request id ──▶ trace ──▶ timeout
//!                                          │
//!          ┌───────────────────────────────┘
//!          ▼
//!   client ip ──▶ throttle ──▶ rate limit ──▶ idempotency ──▶ nollamas ──▶ app
//!                  503            429            409 / replay     challenge
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use admission_control::config::{load_config, AdmissionConfig};
use admission_control::lifecycle::{signals, Shutdown};
use admission_control::observability::{logging, metrics};
use admission_control::HttpServer;

#[derive(Parser, Debug)]
#[command(name = "admission-control")]
#[command(about = "Admission control in front of an HTTP application", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AdmissionConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        "admission-control starting"
    );
    tracing::info!(
        bind_address = %config.listener.bind_address,
        request_timeout_secs = config.timeouts.request_secs,
        rate_limit = config.rate_limit.limit,
        nollamas = config.nollamas.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        "Listening for connections"
    );

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    signals::spawn_signal_handler(shutdown);

    let server = HttpServer::new(config)?;
    server.run(listener, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
