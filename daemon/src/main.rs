//! hubvpn Daemon
//!
//! Terminates client tunnel sessions and routes their traffic through the
//! shared TUN device.

use anyhow::Result;
use clap::Parser;
use hubvpn_daemon::DaemonConfig;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// hubvpn Daemon - Tunnel server
#[derive(Parser, Debug)]
#[command(name = "hubvpnd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "daemon.toml")]
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

    info!("hubvpn daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = DaemonConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    if let Err(e) = hubvpn_daemon::run(config).await {
        error!("Daemon failed: {:#}", e);
        return Err(e);
    }

    info!("hubvpn daemon stopped");
    Ok(())
}
