use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::Level;

use stockpulse_notify::ChannelHub;
use stockpulse_server::ServerConfig;
use stockpulse_store::{Database, InventoryRepo};
use stockpulse_telemetry::{data_dir, init_telemetry, TelemetryConfig};

/// Inventory service that pushes every committed change to WebSocket subscribers.
#[derive(Debug, Parser)]
#[command(name = "stockpulse", version)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Inventory database file.
    #[arg(long, env = "STOCKPULSE_DB")]
    db_path: Option<PathBuf>,

    /// Change channel the bridge listens on.
    #[arg(long, env = "STOCKPULSE_CHANNEL", default_value = "inventory_channel")]
    channel: String,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Where warn+ logs are persisted. Pass `--no-log-db` to disable.
    #[arg(long)]
    log_db: Option<PathBuf>,

    #[arg(long)]
    no_log_db: bool,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut telemetry = TelemetryConfig {
        log_level: args.log_level,
        json: !args.pretty,
        log_to_sqlite: !args.no_log_db,
        ..Default::default()
    };
    if let Some(path) = args.log_db {
        telemetry.log_db_path = path;
    }
    let _telemetry = init_telemetry(telemetry);

    let db_path = args
        .db_path
        .unwrap_or_else(|| data_dir().join("inventory.db"));
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    // Stands in for the database's change trigger: the repository publishes on
    // the hub and the listener subscribes to it.
    let hub = ChannelHub::new();
    let repo = Arc::new(InventoryRepo::new(db, Arc::new(hub.clone()), args.channel.clone()));

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        channel: args.channel,
        ..Default::default()
    };
    let handle = stockpulse_server::start(config, repo, Arc::new(hub))
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "stockpulse ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
