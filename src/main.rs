//! Hostgate: a multi-tenant HTTPS host gateway.
//!
//! This is the application entry point. It initializes tracing, loads
//! configuration from a TOML file, builds the gateway's host routing table,
//! and runs the plaintext and encrypted listeners until shutdown.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostgate::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use hostgate::Gateway;

/// Hostgate: route many hostnames through one gateway
#[derive(Parser, Debug)]
#[command(name = "hostgate", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "hostgate=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    // Load configuration
    let config = AppConfig::load(&args.config)?;

    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Loaded configuration");

    // Log configured hosts
    for host in &config.hosts {
        tracing::info!(
            hostname = %host.hostname,
            handler = ?host.handler,
            "Host configured"
        );
    }
    tracing::info!(
        port = config.http.port,
        https_port = config.http.https_port,
        allow_hosts = ?config.tls.allow_hosts,
        production = config.tls.production,
        "Starting gateway"
    );

    let gateway = Gateway::from_config(config)?;
    gateway.serve().await?;

    Ok(())
}
