// Gateway server entry point

use im_gateway::gateway::Gateway;
use im_gateway::{GatewayConfig, Result, VERSION};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(&path)?,
        None => GatewayConfig::default(),
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

    info!(version = VERSION, "starting IM gateway");

    let gateway = Gateway::new(config)?;
    gateway.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    gateway.stop();
    Ok(())
}
