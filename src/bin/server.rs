use anyhow::Result;
use proximity_match::{ProximityServer, ServerConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env()?;
    info!(bind_addr = %config.bind_addr, service = %config.service_name, "Starting proximity server");

    let server = ProximityServer::bind(config).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c, running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Proximity server stopped");
    Ok(())
}
