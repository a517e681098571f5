//! Garbage collection of stale grid cells
//!
//! The collector only decides *what* to remove. Removal itself goes through
//! a [`GcTarget`], which for the grid store is the same path an explicit
//! removal takes (recovery record first, then delete with cascade).

use async_trait::async_trait;
use blockgrid_monitoring::StoreMetrics;
use blockgrid_storage::{Cell, CellAttributes, CellId, Clock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cancel::CancellationFlag;
use crate::config::duration_secs;
use crate::error::StoreResult;

/// Options for garbage collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarbageCollectionConfig {
    /// Cells touched more recently than this are kept
    #[serde(default = "default_max_age", with = "duration_secs")]
    pub max_age: Duration,
    /// Cells read more often than this are kept
    #[serde(default = "default_min_access_count")]
    pub min_access_count: u64,
    /// Upper bound on removals per sweep
    #[serde(default = "default_max_unused_cells_per_run")]
    pub max_unused_cells_per_run: usize,
    /// Keep every endpoint of an active connection
    #[serde(default = "default_preserve_connected")]
    pub preserve_connected: bool,
    /// Cells touched inside this window are never removed
    #[serde(default = "default_safety_floor", with = "duration_secs")]
    pub safety_floor: Duration,
    /// Generated cells expire after `max_age * generated_age_factor`
    #[serde(default = "default_generated_age_factor")]
    pub generated_age_factor: f64,
    /// Access ceiling for generated cells
    #[serde(default = "default_generated_max_access_count")]
    pub generated_max_access_count: u64,
}

fn default_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_min_access_count() -> u64 {
    2
}

fn default_max_unused_cells_per_run() -> usize {
    100
}

fn default_preserve_connected() -> bool {
    true
}

fn default_safety_floor() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_generated_age_factor() -> f64 {
    0.5
}

fn default_generated_max_access_count() -> u64 {
    1
}

impl Default for GarbageCollectionConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            min_access_count: default_min_access_count(),
            max_unused_cells_per_run: default_max_unused_cells_per_run(),
            preserve_connected: default_preserve_connected(),
            safety_floor: default_safety_floor(),
            generated_age_factor: default_generated_age_factor(),
            generated_max_access_count: default_generated_max_access_count(),
        }
    }
}

/// Results of a garbage collection sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarbageCollectionResult {
    /// Number of cells removed
    pub cells_removed: usize,
    /// Number of connections removed along with them
    pub connections_removed: usize,
    /// Persisted bytes released
    pub memory_freed: usize,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// The sweep stopped early on cancellation
    #[serde(default)]
    pub cancelled: bool,
}

/// What the collector needs to know about a persisted cell
#[derive(Debug, Clone, PartialEq)]
pub struct CellSummary {
    pub id: CellId,
    pub created: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub attributes: CellAttributes,
}

impl<P> From<&Cell<P>> for CellSummary {
    fn from(cell: &Cell<P>) -> Self {
        Self {
            id: cell.id.clone(),
            created: cell.created,
            last_accessed: cell.last_accessed,
            access_count: cell.access_count,
            attributes: cell.attributes.clone(),
        }
    }
}

/// What one successful removal released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub connections_removed: usize,
    pub bytes_freed: usize,
}

/// The store side of a sweep
#[async_trait]
pub trait GcTarget: Send + Sync {
    /// Every persisted cell
    async fn cell_summaries(&self) -> StoreResult<Vec<CellSummary>>;

    /// Ids of cells that are an endpoint of at least one active connection
    async fn connected_cell_ids(&self) -> StoreResult<HashSet<CellId>>;

    /// Remove one cell, recording it for recovery first. The target must
    /// reload the cell and ask `check` again while the cell cannot change.
    /// `None` when the cell disappeared or no longer qualifies.
    async fn remove_for_gc(&self, cell_id: &CellId, check: &dyn RemovalCheck) -> StoreResult<Option<RemovalOutcome>>;
}

/// Policy a target re-applies to the current state of a candidate
pub trait RemovalCheck: Send + Sync {
    /// `connected` tells whether the cell is an endpoint of an active connection
    fn still_eligible(&self, cell: &CellSummary, connected: bool) -> bool;
}

/// Why a preview candidate deserves a second look
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    /// More than five dependencies
    ManyDependencies,
    /// Category or tag `core` / `system`
    CoreComponent,
    /// More than ten reads
    FrequentlyAccessed,
    /// Created less than a day ago and never read
    RecentlyCreated,
}

/// A cell a sweep would remove
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GcCandidate {
    pub cell_id: CellId,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub is_generated: bool,
    pub risks: Vec<RiskFlag>,
}

impl GcCandidate {
    pub fn is_risky(&self) -> bool {
        !self.risks.is_empty()
    }
}

/// Dry-run result of a sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GarbageCollectionPreview {
    /// In removal order
    pub candidates: Vec<GcCandidate>,
}

impl GarbageCollectionPreview {
    pub fn risky(&self) -> impl Iterator<Item = &GcCandidate> {
        self.candidates.iter().filter(|candidate| candidate.is_risky())
    }
}

/// Clears the running flag when a sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Re-entrancy guarded garbage collector
#[derive(Debug)]
pub struct GarbageCollector {
    config: GarbageCollectionConfig,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

impl GarbageCollector {
    pub fn new(config: GarbageCollectionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GarbageCollectionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether policy allows removing this cell, ignoring connectivity
    fn is_expired(&self, cell: &CellSummary, now: DateTime<Utc>) -> bool {
        // Clock skew makes a future timestamp count as "just touched"
        let idle = (now - cell.last_accessed).to_std().unwrap_or_default();

        if idle < self.config.safety_floor {
            return false;
        }

        let (max_age, access_ceiling) = if cell.attributes.is_generated {
            (
                self.config.max_age.mul_f64(self.config.generated_age_factor),
                self.config.generated_max_access_count,
            )
        } else {
            (self.config.max_age, self.config.min_access_count)
        };

        idle >= max_age && cell.access_count <= access_ceiling
    }

    fn keeps_connected(&self, cell_id: &CellId, connected: bool) -> bool {
        let keep = connected && self.config.preserve_connected;
        if keep {
            debug!("GC keeps {}: part of a live connection", cell_id);
        }
        keep
    }

    /// Candidate selection shared by sweep and preview
    async fn select_candidates(&self, target: &dyn GcTarget) -> StoreResult<Vec<CellSummary>> {
        let now = self.clock.now();
        let cells = target.cell_summaries().await?;
        let total = cells.len();

        let mut candidates: Vec<CellSummary> = cells
            .into_iter()
            .filter(|cell| {
                let expired = self.is_expired(cell, now);
                if !expired {
                    debug!("GC keeps {}: recently used or still valuable", cell.id);
                }
                expired
            })
            .collect();

        if self.config.preserve_connected && !candidates.is_empty() {
            let connected = target.connected_cell_ids().await?;
            candidates.retain(|cell| !self.keeps_connected(&cell.id, connected.contains(&cell.id)));
        }

        candidates.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(self.config.max_unused_cells_per_run);

        debug!("GC selected {} of {} cells", candidates.len(), total);
        Ok(candidates)
    }

    fn risks(cell: &CellSummary, now: DateTime<Utc>) -> Vec<RiskFlag> {
        let mut risks = Vec::new();
        if cell.attributes.dependencies.len() > 5 {
            risks.push(RiskFlag::ManyDependencies);
        }
        if cell.attributes.has_label("core") || cell.attributes.has_label("system") {
            risks.push(RiskFlag::CoreComponent);
        }
        if cell.access_count > 10 {
            risks.push(RiskFlag::FrequentlyAccessed);
        }
        if now - cell.created < chrono::Duration::days(1) && cell.access_count == 0 {
            risks.push(RiskFlag::RecentlyCreated);
        }
        risks
    }

    /// Run the selection without removing anything
    pub async fn preview(&self, target: &dyn GcTarget) -> StoreResult<GarbageCollectionPreview> {
        let now = self.clock.now();
        let candidates = self
            .select_candidates(target)
            .await?
            .into_iter()
            .map(|cell| GcCandidate {
                risks: Self::risks(&cell, now),
                cell_id: cell.id,
                last_accessed: cell.last_accessed,
                access_count: cell.access_count,
                is_generated: cell.attributes.is_generated,
            })
            .collect();

        Ok(GarbageCollectionPreview { candidates })
    }

    /// Remove expired cells. A call made while another sweep is running
    /// returns a zeroed result immediately.
    pub async fn sweep(
        &self,
        target: &dyn GcTarget,
        cancel: &CancellationFlag,
    ) -> StoreResult<GarbageCollectionResult> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Garbage collection already running, skipping");
            return Ok(GarbageCollectionResult::default());
        }
        let _guard = SweepGuard(&self.running);

        let start = Instant::now();
        info!("Starting garbage collection");

        let candidates = self.select_candidates(target).await?;
        let mut result = GarbageCollectionResult::default();

        for candidate in candidates {
            if cancel.is_cancelled() {
                info!("Garbage collection cancelled after {} removals", result.cells_removed);
                result.cancelled = true;
                break;
            }

            match target.remove_for_gc(&candidate.id, self).await {
                Ok(Some(outcome)) => {
                    debug!("GC removed {}", candidate.id);
                    result.cells_removed += 1;
                    result.connections_removed += outcome.connections_removed;
                    result.memory_freed += outcome.bytes_freed;
                }
                Ok(None) => {
                    debug!("GC candidate {} is gone or was used since selection", candidate.id);
                }
                Err(e) => {
                    warn!("Failed to remove cell {} during GC: {}", candidate.id, e);
                }
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Garbage collection completed: removed {} cells and {} connections, freed {} bytes in {}ms",
            result.cells_removed, result.connections_removed, result.memory_freed, result.duration_ms
        );
        StoreMetrics::record_gc_sweep(
            result.cells_removed,
            result.connections_removed,
            result.memory_freed,
            result.duration_ms,
        );

        Ok(result)
    }
}

impl RemovalCheck for GarbageCollector {
    fn still_eligible(&self, cell: &CellSummary, connected: bool) -> bool {
        !self.keeps_connected(&cell.id, connected) && self.is_expired(cell, self.clock.now())
    }
}
