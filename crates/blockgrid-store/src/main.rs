use anyhow::{Context, Result};
use blockgrid_monitoring::MonitoringConfig;
use blockgrid_store::{BackgroundTasks, GridStore, StoreConfig};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Set up monitoring
    let monitoring_config = MonitoringConfig {
        service_name: "blockgrid".to_string(),
        log_filter: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info,blockgrid_store=debug".to_string()),
        enable_json_logging: std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false),
        log_file: std::env::var("LOG_FILE").ok().map(Into::into),
        environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
    };

    let _logging_guard = blockgrid_monitoring::init(&monitoring_config).context("Failed to initialize monitoring")?;

    // Load configuration from environment variables
    let config = StoreConfig::load().context("Failed to load configuration")?;

    let store: Arc<GridStore<serde_json::Value>> = Arc::new(
        GridStore::builder()
            .config(config)
            .build()
            .await
            .context("Failed to open grid store")?,
    );
    let tasks = BackgroundTasks::spawn(store.clone());

    info!("Blockgrid store running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tasks.shutdown().await;
    store.flush_metadata().await.context("Final metadata flush failed")?;
    blockgrid_monitoring::shutdown();

    Ok(())
}
