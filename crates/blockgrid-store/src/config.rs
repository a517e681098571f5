//! Configuration for the Blockgrid store
//!
//! This module contains the configuration types and loading functionality.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::CacheConfig;
use crate::error::{StoreError, StoreResult};
use crate::gc::GarbageCollectionConfig;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Grid width before any growth
    #[serde(default = "default_initial_width")]
    pub initial_width: u32,

    /// Grid height before any growth
    #[serde(default = "default_initial_height")]
    pub initial_height: u32,

    /// Multiplier applied to an out-of-bounds coordinate when growing the grid
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Garbage collection policy
    #[serde(default)]
    pub gc: GarbageCollectionConfig,

    /// Interval between background GC sweeps
    #[serde(default = "default_gc_interval", with = "duration_secs")]
    pub gc_interval: Duration,

    /// Interval between background metadata flushes
    #[serde(default = "default_metadata_flush_interval", with = "duration_secs")]
    pub metadata_flush_interval: Duration,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_initial_width() -> u32 {
    100
}

fn default_initial_height() -> u32 {
    100
}

fn default_growth_factor() -> f64 {
    1.2
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_metadata_flush_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_log_level() -> String {
    "info".to_string()
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Read and parse an environment variable, warning when it does not parse
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Invalid {} value: {}", name, raw);
            None
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn load() -> StoreResult<Self> {
        let mut config = Self::default();

        if let Some(width) = env_parse("BLOCKGRID_INITIAL_WIDTH") {
            config.initial_width = width;
        }

        if let Some(height) = env_parse("BLOCKGRID_INITIAL_HEIGHT") {
            config.initial_height = height;
        }

        if let Some(factor) = env_parse("BLOCKGRID_GROWTH_FACTOR") {
            config.growth_factor = factor;
        }

        if let Some(size_mb) = env_parse::<usize>("BLOCKGRID_CACHE_MAX_SIZE_MB") {
            config.cache.max_size_bytes = size_mb * 1024 * 1024;
        }

        if let Some(hours) = env_parse::<u64>("BLOCKGRID_GC_MAX_AGE_HOURS") {
            config.gc.max_age = Duration::from_secs(hours * 60 * 60);
        }

        if let Some(count) = env_parse("BLOCKGRID_GC_MIN_ACCESS_COUNT") {
            config.gc.min_access_count = count;
        }

        if let Some(max_cells) = env_parse("BLOCKGRID_GC_MAX_CELLS_PER_RUN") {
            config.gc.max_unused_cells_per_run = max_cells;
        }

        if let Ok(preserve) = env::var("BLOCKGRID_GC_PRESERVE_CONNECTED") {
            config.gc.preserve_connected = preserve.to_lowercase() == "true" || preserve == "1";
        }

        if let Some(secs) = env_parse::<u64>("BLOCKGRID_GC_INTERVAL_SECS") {
            config.gc_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("BLOCKGRID_METADATA_FLUSH_INTERVAL_SECS") {
            config.metadata_flush_interval = Duration::from_secs(secs);
        }

        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.log_level = log_level;
        }

        config.validate()?;

        info!("Loaded store configuration");
        Ok(config)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> StoreResult<()> {
        if !(self.growth_factor.is_finite() && self.growth_factor >= 1.0) {
            return Err(StoreError::Configuration(format!(
                "Growth factor must be at least 1.0, got {}",
                self.growth_factor
            )));
        }

        if self.cache.max_size_bytes == 0 {
            return Err(StoreError::Configuration("Cache size must be non-zero".to_string()));
        }

        if self.gc_interval.is_zero() || self.metadata_flush_interval.is_zero() {
            return Err(StoreError::Configuration(
                "Background task intervals must be non-zero".to_string(),
            ));
        }

        if !(self.gc.generated_age_factor > 0.0 && self.gc.generated_age_factor <= 1.0) {
            return Err(StoreError::Configuration(format!(
                "Generated age factor must be in (0, 1], got {}",
                self.gc.generated_age_factor
            )));
        }

        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_width: default_initial_width(),
            initial_height: default_initial_height(),
            growth_factor: default_growth_factor(),
            cache: CacheConfig::default(),
            gc: GarbageCollectionConfig::default(),
            gc_interval: default_gc_interval(),
            metadata_flush_interval: default_metadata_flush_interval(),
            log_level: default_log_level(),
        }
    }
}
