//!
//! Blockgrid Store - elastic grid-addressed block store
//!
//! Cells live at integer grid coordinates and are related by directed
//! connections. The store sits on a pluggable persistence backend, keeps a
//! bounded cache in front of it, reclaims stale cells through a garbage
//! collector and exports or imports the whole grid as a signed bundle.

/// Cache module
pub mod cache;

/// Cooperative cancellation module
pub mod cancel;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Garbage collection module
pub mod gc;

/// Grid store module
pub mod grid;

/// Per-coordinate locks module
pub mod locks;

/// Background task module
pub mod scheduler;

/// Export bundle module
pub mod snapshot;

/// Live sync module
pub mod sync;

// Re-export key types
pub use cache::{CacheConfig, CacheManager, CacheMetrics};
pub use cancel::CancellationFlag;
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use gc::{
    CellSummary, GarbageCollectionConfig, GarbageCollectionPreview, GarbageCollectionResult, GarbageCollector,
    GcCandidate, GcTarget, RemovalCheck, RemovalOutcome, RiskFlag,
};
pub use grid::{GridEvent, GridStatistics, GridStore, GridStoreBuilder, StorageStats};
pub use locks::CoordinateLocks;
pub use scheduler::BackgroundTasks;
pub use snapshot::{compute_signature, ExportBundle};
pub use sync::{ChannelLiveSync, LiveSync, SyncMessage};

// The record types callers build requests from
pub use blockgrid_storage::{Cell, CellAttributes, CellId, Connection, GridDimensions, GridMetadata, GridPosition};
