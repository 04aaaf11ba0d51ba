use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use unilease_bin::config::{load_config_from_path, Args};
use unilease_bin::DhcpService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = match load_config_from_path(&args.config_file) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    info!("Config loaded: {:?}", config);

    let mut service = DhcpService::new(config);
    service.start();

    match args.duration {
        Some(secs) => {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!("Run duration elapsed, shutting down.");
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl-C, shutting down.");
        }
    }

    if let Err(e) = service.stop().await {
        error!("DHCP server error: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}
