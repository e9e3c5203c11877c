//! hubvpn Client
//!
//! Joins a hubvpn virtual network through a local TUN device.

use anyhow::Result;
use clap::Parser;
use hubvpn_client::ClientConfig;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// hubvpn Client - Tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "hubvpn")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "client.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("hubvpn client v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    if let Err(e) = hubvpn_client::run(config).await {
        error!("Client failed: {:#}", e);
        return Err(e);
    }

    info!("hubvpn client stopped");
    Ok(())
}
