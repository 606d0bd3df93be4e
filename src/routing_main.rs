// Routing service entry point

use im_gateway::routing::RoutingService;
use im_gateway::{Result, RoutingConfig, VERSION};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => RoutingConfig::from_file(&path)?,
        None => RoutingConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if config.debug_log {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    info!(version = VERSION, "starting routing service");

    let service = RoutingService::new(config)?;
    service.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    service.stop();
    Ok(())
}
