//! Store metrics, recorded as structured tracing events under the
//! `blockgrid::metrics` target so any subscriber can aggregate them.

use tracing::info;

/// Blockgrid store specific metrics
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record a finished garbage collection sweep
    pub fn record_gc_sweep(cells_removed: usize, connections_removed: usize, memory_freed: usize, duration_ms: u64) {
        info!(
            target: "blockgrid::metrics",
            cells_removed,
            connections_removed,
            memory_freed,
            duration_ms,
            "GC sweep"
        );
    }

    /// Record cache evictions caused by one write
    pub fn record_cache_evictions(evicted: usize, freed_bytes: usize, current_size: usize) {
        info!(
            target: "blockgrid::metrics",
            evicted,
            freed_bytes,
            current_size,
            "Cache eviction"
        );
    }

    /// Record a snapshot export
    pub fn record_export(cells: usize, connections: usize, duration_ms: u64) {
        info!(target: "blockgrid::metrics", cells, connections, duration_ms, "Snapshot export");
    }

    /// Record a snapshot import attempt
    pub fn record_import(cells: usize, connections: usize, duration_ms: u64, success: bool) {
        info!(
            target: "blockgrid::metrics",
            cells,
            connections,
            duration_ms,
            success,
            "Snapshot import"
        );
    }

    /// Record a grid growth event
    pub fn record_grid_growth(width: u32, height: u32) {
        info!(target: "blockgrid::metrics", width, height, "Grid expanded");
    }
}
