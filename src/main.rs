use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use analysis_persistence::{PersistenceConfig, PersistenceEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "analysis_persistence=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Analysis Persistence Service v0.1.0");

    let config = PersistenceConfig::from_env()?;

    info!("Configuration loaded:");
    info!("  Backend: {}", config.backend.kind());
    info!("  Location: {}", config.backend.describe());
    info!(
        "  Offload threshold: {} bytes",
        config.adapter.offload.threshold_bytes()
    );
    info!("  Batch parallelism: {}", config.batch_max_parallelism);
    info!("  Operation timeout: {:?}", config.operation_timeout);

    let engine = Arc::new(PersistenceEngine::start(&config).await?);

    let gc_engine = engine.clone();
    let gc_interval = config.gc_interval;
    let gc_grace = config.gc_grace;
    let gc_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gc_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match gc_engine.collect_garbage(gc_grace).await {
                Ok(0) => {}
                Ok(removed) => info!("Garbage collection removed {} orphaned blobs", removed),
                Err(e) => error!("Garbage collection failed: {}", e),
            }
        }
    });

    info!("Analysis Persistence Service started successfully");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal, gracefully shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    gc_handle.abort();
    engine.selector().shutdown().await;

    info!("Analysis Persistence Service shutdown complete");
    Ok(())
}
