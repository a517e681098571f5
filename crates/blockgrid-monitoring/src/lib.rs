//! Monitoring for the Blockgrid store: structured logging setup and
//! metrics recording.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_test_tracing, LogExt, LoggingGuard};
pub use metrics::StoreMetrics;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to startup logs
    pub service_name: String,
    /// Log level filter (e.g., "info,blockgrid_store=debug")
    pub log_filter: String,
    /// Emit JSON instead of human-readable logs
    pub enable_json_logging: bool,
    /// Optional file receiving daily-rotated JSON logs
    pub log_file: Option<PathBuf>,
    /// Environment (dev, staging, prod)
    pub environment: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "blockgrid".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            log_file: None,
            environment: "dev".to_string(),
        }
    }
}

/// Initialize monitoring system
pub fn init(config: &MonitoringConfig) -> anyhow::Result<LoggingGuard> {
    let guard = init_logging(config)?;
    info!("Monitoring initialized with config: {:?}", config);
    Ok(guard)
}

/// Shutdown the monitoring system
pub fn shutdown() {
    info!("Shutting down monitoring system");
}
