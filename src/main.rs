//! keeper-log - single keeper node over tiered log storage.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keeper_log::{KeeperConfig, KeeperServer};

#[derive(Parser, Debug)]
#[command(name = "keeper-log")]
#[command(about = "Keeper node with segmented log storage tiered onto object storage")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory used when no config file is given
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => KeeperConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            std::fs::create_dir_all(&args.data_dir)?;
            KeeperConfig::local(&args.data_dir)
        }
    };

    let server = KeeperServer::start(config)
        .await
        .context("keeper server failed to start")?;
    let report = server.recovery_report();
    info!(
        "Keeper {} ready at index {} ({} entries replayed)",
        server.server_id(),
        report.last_index,
        report.replayed
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    server.shutdown().await?;
    Ok(())
}
