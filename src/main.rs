use anyhow::Result;
use chargebill::Config;
use chargebill::engine::ChargingEngine;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load configuration from {}: {}", path, e))?,
        None => Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?,
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    chargebill::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Chargebill starting up for {} ({})",
        config.charger.name, config.charger.id
    );

    let engine = ChargingEngine::from_config(config.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create engine: {}", e))?;

    let report = engine
        .recover()
        .await
        .map_err(|e| anyhow::anyhow!("Recovery failed: {}", e))?;
    if !report.unsettled.is_empty() {
        warn!(
            "{} recovered session(s) could not be settled yet",
            report.unsettled.len()
        );
    }

    let web_task = if cfg!(feature = "web") && config.web.enabled {
        let web_engine = engine.clone();
        let host = config.web.host.clone();
        let port = config.web.port;
        Some(tokio::spawn(async move {
            if let Err(e) = chargebill::web::serve(web_engine, &host, port).await {
                error!("{}", e);
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    if let Some(task) = web_task {
        task.abort();
    }
    info!("Chargebill shutdown complete");
    Ok(())
}
