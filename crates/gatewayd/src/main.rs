use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use dotenv::dotenv;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use domain::DeviceConfig;
use gateway::{Gateway, TagStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Industrial data acquisition gateway")]
struct Args {
    /// Path to the gateway config file (without extension)
    #[arg(long, default_value = "config/gateway")]
    config: String,
}

/// Top-level daemon configuration: the store's freshness window plus the
/// device fleet.
#[derive(Debug, Deserialize)]
struct GatewayConfig {
    #[serde(default = "default_freshness_window_ms")]
    freshness_window_ms: u64,
    devices: Vec<DeviceConfig>,
}

fn default_freshness_window_ms() -> u64 {
    15_000
}

impl GatewayConfig {
    /// File first, then environment overrides (e.g. GATEWAY__FRESHNESS_WINDOW_MS).
    fn load(path: &str) -> Result<Self> {
        let settings = Config::builder()
            .set_default("freshness_window_ms", default_freshness_window_ms())?
            .add_source(File::with_name(path).required(true))
            .add_source(Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .with_context(|| format!("failed to read config from {path}"))?;
        settings
            .try_deserialize()
            .context("invalid gateway configuration")
    }
}

async fn run() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,gateway=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Gateway daemon starting, pid {}", std::process::id());

    let config = GatewayConfig::load(&args.config)?;
    info!(
        devices = config.devices.len(),
        freshness_window_ms = config.freshness_window_ms,
        "configuration loaded from {}",
        args.config
    );

    let store = Arc::new(TagStore::new(chrono::Duration::milliseconds(
        config.freshness_window_ms as i64,
    )));
    let gateway = Gateway::start(config.devices, store)
        .context("gateway failed to start")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    gateway.shutdown().await;
    info!("gateway stopped cleanly");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}
