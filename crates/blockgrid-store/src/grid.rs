//! The grid store facade
//!
//! [`GridStore`] owns the logical 2-D grid: cells at integer coordinates,
//! directed connections between them, and the grid metadata. Persistence is
//! authoritative. The cache is refreshed synchronously on every write so a
//! read after a write on the same coordinate always sees it.
//!
//! Mutations of one coordinate are serialised through [`CoordinateLocks`].
//! Several store instances sharing one backend are not coordinated with each
//! other; embedding callers must serialise writes across instances.

use async_trait::async_trait;
use blockgrid_graph::{GraphEdge, GraphNode, GraphReport, GraphValidator};
use blockgrid_monitoring::{LogExt, StoreMetrics};
use blockgrid_storage::{
    Cell, CellAttributes, CellId, Clock, Connection, GridDimensions, GridMetadata, GridPersistence, GridPosition,
    InMemoryGridPersistence, InMemoryRecoveryLog, Payload, RecordKind, RecoveryLog, RecoveryRecord, RemovalReason,
    SystemClock, WriteBatch, METADATA_KEY, SCHEMA_VERSION,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheManager, CacheMetrics};
use crate::cancel::CancellationFlag;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::gc::{
    CellSummary, GarbageCollectionPreview, GarbageCollectionResult, GarbageCollector, GcTarget, RemovalCheck,
    RemovalOutcome,
};
use crate::locks::CoordinateLocks;
use crate::snapshot::ExportBundle;
use crate::sync::{LiveSync, SyncMessage};

/// Capacity of the observer channel. Slow observers miss events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notifications delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GridEvent {
    CellWritten { cell_id: CellId, version: u64 },
    CellRemoved { cell_id: CellId, reason: RemovalReason },
    CellRestored { cell_id: CellId },
    ConnectionCreated { id: Uuid, from: CellId, to: CellId },
    ConnectionRemoved { id: Uuid },
    GridExpanded { dimensions: GridDimensions },
    SnapshotImported { cells: usize, connections: usize },
}

/// Live view of the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridStatistics {
    pub total_cells: u64,
    /// Connected components of two or more cells
    pub active_workflows: u64,
    /// Persisted bytes of cell and connection records
    pub memory_usage_bytes: usize,
    pub cache_hit_rate: f64,
    pub dimensions: GridDimensions,
    pub last_update: DateTime<Utc>,
}

/// Record-level view of what the store holds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub cell_records: usize,
    pub connection_records: usize,
    pub cell_bytes: usize,
    pub connection_bytes: usize,
    pub recovery_records: usize,
    pub cache: CacheMetrics,
}

/// The fields of a stored cell the collector needs; the payload is skipped
#[derive(Deserialize)]
struct StoredCellSummary {
    id: CellId,
    created: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    access_count: u64,
    #[serde(default)]
    attributes: CellAttributes,
}

/// Elastic grid-addressed block store
pub struct GridStore<P: Payload> {
    persistence: Arc<dyn GridPersistence>,
    recovery: Arc<dyn RecoveryLog>,
    cache: Mutex<CacheManager<Cell<P>>>,
    gc: GarbageCollector,
    clock: Arc<dyn Clock>,
    live_sync: Option<Arc<dyn LiveSync>>,
    config: StoreConfig,
    /// Held for writing from building a metadata change until it is committed
    metadata: RwLock<GridMetadata>,
    locks: CoordinateLocks,
    events: broadcast::Sender<GridEvent>,
    flushing: AtomicBool,
}

impl<P: Payload> fmt::Debug for GridStore<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridStore")
            .field("persistence", &self.persistence)
            .field("recovery", &self.recovery)
            .field("live_sync", &self.live_sync.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Clears the flush flag on every exit path
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Builder for [`GridStore`]. Anything not supplied falls back to the
/// in-memory implementation or the configured defaults.
pub struct GridStoreBuilder<P: Payload> {
    config: StoreConfig,
    persistence: Option<Arc<dyn GridPersistence>>,
    recovery: Option<Arc<dyn RecoveryLog>>,
    clock: Option<Arc<dyn Clock>>,
    cache: Option<CacheManager<Cell<P>>>,
    gc: Option<GarbageCollector>,
    live_sync: Option<Arc<dyn LiveSync>>,
}

impl<P: Payload> Default for GridStoreBuilder<P> {
    fn default() -> Self {
        Self {
            config: StoreConfig::default(),
            persistence: None,
            recovery: None,
            clock: None,
            cache: None,
            gc: None,
            live_sync: None,
        }
    }
}

impl<P: Payload> GridStoreBuilder<P> {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn GridPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn recovery_log(mut self, recovery: Arc<dyn RecoveryLog>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn cache(mut self, cache: CacheManager<Cell<P>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn garbage_collector(mut self, gc: GarbageCollector) -> Self {
        self.gc = Some(gc);
        self
    }

    pub fn live_sync(mut self, live_sync: Arc<dyn LiveSync>) -> Self {
        self.live_sync = Some(live_sync);
        self
    }

    /// Open the store, picking up persisted metadata when there is any
    pub async fn build(self) -> StoreResult<GridStore<P>> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let persistence: Arc<dyn GridPersistence> = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryGridPersistence::new()));
        let recovery: Arc<dyn RecoveryLog> = self.recovery.unwrap_or_else(|| Arc::new(InMemoryRecoveryLog::new()));
        let cache = self
            .cache
            .unwrap_or_else(|| CacheManager::new(self.config.cache.clone(), clock.clone()));
        let gc = self
            .gc
            .unwrap_or_else(|| GarbageCollector::new(self.config.gc.clone(), clock.clone()));

        let metadata = match persistence.get_record(RecordKind::Metadata, METADATA_KEY).await? {
            Some(data) => {
                let metadata: GridMetadata = serde_json::from_slice(&data)?;
                info!(
                    "Opened grid store {}x{} with {} cells",
                    metadata.dimensions.width, metadata.dimensions.height, metadata.total_cells
                );
                metadata
            }
            None => {
                let dimensions = GridDimensions::new(self.config.initial_width, self.config.initial_height);
                info!("Created new grid store {}x{}", dimensions.width, dimensions.height);
                GridMetadata::new(dimensions, clock.now())
            }
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(GridStore {
            persistence,
            recovery,
            cache: Mutex::new(cache),
            gc,
            clock,
            live_sync: self.live_sync,
            config: self.config,
            metadata: RwLock::new(metadata),
            locks: CoordinateLocks::new(),
            events,
            flushing: AtomicBool::new(false),
        })
    }
}

fn workflow_graph(cell_ids: &[CellId], connections: &[Connection], sources: &HashSet<CellId>) -> GraphValidator {
    let nodes = cell_ids.iter().map(|id| {
        if sources.contains(id) {
            GraphNode::source(id.as_str())
        } else {
            GraphNode::new(id.as_str())
        }
    });
    let edges = connections
        .iter()
        .filter(|connection| connection.is_active)
        .map(|connection| GraphEdge::new(connection.from.as_str(), connection.to.as_str()));
    GraphValidator::new(nodes, edges)
}

impl<P: Payload> GridStore<P> {
    pub fn builder() -> GridStoreBuilder<P> {
        GridStoreBuilder::default()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn garbage_collector(&self) -> &GarbageCollector {
        &self.gc
    }

    /// Current in-memory metadata
    pub async fn metadata(&self) -> GridMetadata {
        self.metadata.read().await.clone()
    }

    pub async fn dimensions(&self) -> GridDimensions {
        self.metadata.read().await.dimensions
    }

    /// Receive change notifications. Delivery never blocks the store.
    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.events.subscribe()
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache().metrics()
    }

    fn cache(&self) -> MutexGuard<'_, CacheManager<Cell<P>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: GridEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Push a write to the live-sync transport without waiting on it
    fn notify_sync(&self, cell: &Cell<P>) {
        let Some(sync) = self.live_sync.clone() else {
            return;
        };
        if !sync.is_connected() {
            debug!("Live sync offline, skipping update for {}", cell.id);
            return;
        }
        let data = match serde_json::to_value(cell) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode live sync update for {}: {}", cell.id, e);
                return;
            }
        };
        let message = SyncMessage::grid_update(cell.id.as_str(), data, self.clock.now());
        tokio::spawn(async move {
            let _ = sync.publish(message).await.log_err("Live sync failed");
        });
    }

    async fn load_cell(&self, id: &CellId) -> StoreResult<Option<(Cell<P>, usize)>> {
        match self.persistence.get_record(RecordKind::Cell, id.as_str()).await? {
            Some(data) => Ok(Some((Cell::from_bytes(&data)?, data.len()))),
            None => Ok(None),
        }
    }

    async fn cell_exists(&self, id: &CellId) -> StoreResult<bool> {
        Ok(self
            .persistence
            .get_record(RecordKind::Cell, id.as_str())
            .await?
            .is_some())
    }

    /// Every connection with its persisted size, in id order
    async fn load_connection_records(&self) -> StoreResult<Vec<(Connection, usize)>> {
        self.persistence
            .list_records(RecordKind::Connection)
            .await?
            .into_iter()
            .map(|(_, data)| -> StoreResult<(Connection, usize)> { Ok((Connection::from_bytes(&data)?, data.len())) })
            .collect()
    }

    async fn load_connections(&self) -> StoreResult<Vec<Connection>> {
        Ok(self
            .load_connection_records()
            .await?
            .into_iter()
            .map(|(connection, _)| connection)
            .collect())
    }

    async fn cell_ids(&self) -> StoreResult<Vec<CellId>> {
        self.persistence
            .list_keys(RecordKind::Cell)
            .await?
            .iter()
            .map(|key| key.parse::<CellId>().map_err(StoreError::from))
            .collect()
    }

    /// Write a cell, keeping the existing attributes on overwrite
    pub async fn set_cell(&self, position: GridPosition, payload: P) -> StoreResult<Cell<P>> {
        self.write_cell(position, payload, None).await
    }

    /// Write a cell with explicit classification attributes
    pub async fn set_cell_with(
        &self,
        position: GridPosition,
        payload: P,
        attributes: CellAttributes,
    ) -> StoreResult<Cell<P>> {
        self.write_cell(position, payload, Some(attributes)).await
    }

    async fn write_cell(
        &self,
        position: GridPosition,
        payload: P,
        attributes: Option<CellAttributes>,
    ) -> StoreResult<Cell<P>> {
        let _guard = self.locks.acquire(position).await;
        let id = position.cell_id();
        let now = self.clock.now();

        let existing = self.load_cell(&id).await?;
        let is_new = existing.is_none();
        let cell = match existing {
            Some((previous, _)) => {
                let attributes = attributes.unwrap_or_else(|| previous.attributes.clone());
                previous.overwritten(payload, attributes, now)
            }
            None => Cell::new(position, payload, attributes.unwrap_or_default(), now),
        };

        let mut metadata = self.metadata.write().await;
        let mut next = metadata.clone();
        let grown = next.dimensions.grown_to_fit(position, self.config.growth_factor);
        if let Some(dimensions) = grown {
            next.dimensions = dimensions;
        }
        if is_new {
            next.total_cells += 1;
        }
        next.last_modified = now;

        let mut batch = WriteBatch::new();
        batch
            .put(RecordKind::Cell, id.as_str(), cell.to_bytes()?)
            .put(RecordKind::Metadata, METADATA_KEY, serde_json::to_vec(&next)?);
        self.persistence.apply_batch(batch).await?;

        *metadata = next;
        drop(metadata);

        if let Some(dimensions) = grown {
            info!(
                "Grid expanded to {}x{} for write at {}",
                dimensions.width, dimensions.height, position
            );
            StoreMetrics::record_grid_growth(dimensions.width, dimensions.height);
            self.emit(GridEvent::GridExpanded { dimensions });
        }

        self.cache().set(id.as_str(), cell.clone());
        debug!("Stored cell {} version {}", id, cell.version);

        self.emit(GridEvent::CellWritten {
            cell_id: id,
            version: cell.version,
        });
        self.notify_sync(&cell);

        Ok(cell)
    }

    /// Read a cell. Every hit counts as an access.
    pub async fn get_cell(&self, position: GridPosition) -> StoreResult<Option<Cell<P>>> {
        let _guard = self.locks.acquire(position).await;
        let id = position.cell_id();

        let cached = self.cache().get(id.as_str());
        let mut cell = match cached {
            Some(cell) => cell,
            None => match self.load_cell(&id).await? {
                Some((cell, _)) => cell,
                None => return Ok(None),
            },
        };

        cell.mark_accessed(self.clock.now());

        // Access stats only feed GC; losing one update is acceptable
        match cell.to_bytes() {
            Ok(data) => {
                if let Err(e) = self.persistence.put_record(RecordKind::Cell, id.as_str(), data).await {
                    warn!("Failed to persist access stats for {}: {}", id, e);
                }
            }
            Err(e) => warn!("Failed to encode access stats for {}: {}", id, e),
        }

        self.cache().set(id.as_str(), cell.clone());
        Ok(Some(cell))
    }

    /// Remove the cell at `position` and every connection touching it.
    /// Returns `false` when the coordinate is empty.
    pub async fn remove_cell(&self, position: GridPosition) -> StoreResult<bool> {
        let _guard = self.locks.acquire(position).await;
        let removed = self
            .remove_locked(position, RemovalReason::ExplicitRemoval, None)
            .await?;
        Ok(removed.is_some())
    }

    /// The single removal path. The caller holds the coordinate lock. With a
    /// `check`, the cell is only removed if it still qualifies as loaded here.
    async fn remove_locked(
        &self,
        position: GridPosition,
        reason: RemovalReason,
        check: Option<&dyn RemovalCheck>,
    ) -> StoreResult<Option<RemovalOutcome>> {
        let id = position.cell_id();
        let Some((cell, cell_bytes)) = self.load_cell(&id).await? else {
            // Drop a stale cache entry if one survived
            self.cache().remove(id.as_str());
            return Ok(None);
        };

        let touching: Vec<(Connection, usize)> = self
            .load_connection_records()
            .await?
            .into_iter()
            .filter(|(connection, _)| connection.touches(&id))
            .collect();

        if let Some(check) = check {
            let connected = touching.iter().any(|(connection, _)| connection.is_active);
            if !check.still_eligible(&CellSummary::from(&cell), connected) {
                return Ok(None);
            }
        }

        let now = self.clock.now();
        let record = RecoveryRecord::new(&cell, reason, now)?;

        let mut metadata = self.metadata.write().await;
        let mut next = metadata.clone();
        next.total_cells = next.total_cells.saturating_sub(1);
        next.last_modified = now;

        let mut batch = WriteBatch::new();
        batch.delete(RecordKind::Cell, id.as_str());
        for (connection, _) in &touching {
            batch.delete(RecordKind::Connection, connection.key());
        }
        batch.put(RecordKind::Metadata, METADATA_KEY, serde_json::to_vec(&next)?);

        // Backup before delete; withdrawn again if the delete does not commit
        let record_key = record.key.clone();
        self.recovery.append(record).await?;
        if let Err(e) = self.persistence.apply_batch(batch).await {
            let _ = self
                .recovery
                .discard(&record_key)
                .await
                .log_err("Failed to withdraw recovery record of an uncommitted removal");
            return Err(e.into());
        }

        *metadata = next;
        drop(metadata);

        self.cache().remove(id.as_str());

        let outcome = RemovalOutcome {
            connections_removed: touching.len(),
            bytes_freed: cell_bytes + touching.iter().map(|(_, size)| size).sum::<usize>(),
        };
        debug!(
            "Removed cell {} ({}) with {} connections",
            id, reason, outcome.connections_removed
        );
        self.emit(GridEvent::CellRemoved { cell_id: id, reason });

        Ok(Some(outcome))
    }

    /// Connect two live cells with weight 1.0
    pub async fn create_connection(
        &self,
        from: GridPosition,
        to: GridPosition,
        connection_type: impl Into<String>,
    ) -> StoreResult<Connection> {
        self.create_weighted_connection(from, to, connection_type, 1.0).await
    }

    /// Connect two live cells. Fails with a dangling reference when either
    /// endpoint is empty.
    pub async fn create_weighted_connection(
        &self,
        from: GridPosition,
        to: GridPosition,
        connection_type: impl Into<String>,
        weight: f64,
    ) -> StoreResult<Connection> {
        // Both endpoints stay put until the connection is stored
        let _guards = self.locks.acquire_pair(from, to).await;
        let from_id = from.cell_id();
        let to_id = to.cell_id();

        if !self.cell_exists(&from_id).await? || !self.cell_exists(&to_id).await? {
            return Err(StoreError::DanglingReference {
                from: from_id,
                to: to_id,
            });
        }

        let mut connection = Connection::new(from_id, to_id, connection_type, self.clock.now());
        connection.weight = weight;

        self.persistence
            .put_record(RecordKind::Connection, &connection.key(), connection.to_bytes()?)
            .await?;

        debug!(
            "Connected {} -> {} ({})",
            connection.from, connection.to, connection.connection_type
        );
        self.emit(GridEvent::ConnectionCreated {
            id: connection.id,
            from: connection.from.clone(),
            to: connection.to.clone(),
        });

        Ok(connection)
    }

    /// Delete a connection by id. Returns `false` if it did not exist.
    pub async fn remove_connection(&self, id: Uuid) -> StoreResult<bool> {
        let removed = self
            .persistence
            .delete_record(RecordKind::Connection, &id.to_string())
            .await?;
        if removed {
            self.emit(GridEvent::ConnectionRemoved { id });
        }
        Ok(removed)
    }

    /// Connections leaving `position`, oldest first
    pub async fn connections_from(&self, position: GridPosition) -> StoreResult<Vec<Connection>> {
        let id = position.cell_id();
        let mut connections: Vec<Connection> = self
            .load_connections()
            .await?
            .into_iter()
            .filter(|connection| connection.from == id)
            .collect();
        connections.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(connections)
    }

    /// Connections arriving at `position`, oldest first
    pub async fn connections_to(&self, position: GridPosition) -> StoreResult<Vec<Connection>> {
        let id = position.cell_id();
        let mut connections: Vec<Connection> = self
            .load_connections()
            .await?
            .into_iter()
            .filter(|connection| connection.to == id)
            .collect();
        connections.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(connections)
    }

    /// Every connection, in id order
    pub async fn connections(&self) -> StoreResult<Vec<Connection>> {
        self.load_connections().await
    }

    /// Export the whole store as a signed bundle
    pub async fn export_snapshot(&self, cancel: &CancellationFlag) -> StoreResult<ExportBundle<P>> {
        let start = Instant::now();

        // Writers commit under the metadata write lock, so this is a consistent view
        let metadata = self.metadata.read().await;

        let mut cells = Vec::new();
        for (_, data) in self.persistence.list_records(RecordKind::Cell).await? {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled("export".to_string()));
            }
            cells.push(Cell::<P>::from_bytes(&data)?);
        }
        let connections = self.load_connections().await?;

        let cell_ids: Vec<CellId> = cells.iter().map(|cell| cell.id.clone()).collect();
        let mut exported_metadata = metadata.clone();
        drop(metadata);
        exported_metadata.total_cells = cells.len() as u64;
        exported_metadata.active_workflows =
            workflow_graph(&cell_ids, &connections, &HashSet::new()).workflow_count() as u64;

        let bundle = ExportBundle::new(SCHEMA_VERSION, self.clock.now(), exported_metadata, cells, connections)?;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Exported {} cells and {} connections",
            bundle.cells.len(),
            bundle.connections.len()
        );
        StoreMetrics::record_export(bundle.cells.len(), bundle.connections.len(), duration_ms);

        Ok(bundle)
    }

    /// Replace the whole store with a bundle's contents.
    ///
    /// The signature is checked before anything else. Nothing is written
    /// until the full replacement batch is built, and the batch commits
    /// atomically, so a failed or cancelled import leaves the store as it was.
    pub async fn import_snapshot(&self, bundle: &ExportBundle<P>, cancel: &CancellationFlag) -> StoreResult<()> {
        let start = Instant::now();
        let result = self.import_inner(bundle, cancel).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        StoreMetrics::record_import(bundle.cells.len(), bundle.connections.len(), duration_ms, result.is_ok());
        match &result {
            Ok(()) => info!(
                "Imported {} cells and {} connections",
                bundle.cells.len(),
                bundle.connections.len()
            ),
            Err(e) => warn!("Snapshot import rejected: {}", e),
        }
        result
    }

    async fn import_inner(&self, bundle: &ExportBundle<P>, cancel: &CancellationFlag) -> StoreResult<()> {
        bundle.verify()?;

        let cell_ids: HashSet<CellId> = bundle.cells.iter().map(|cell| cell.id.clone()).collect();
        if let Some(dangling) = bundle
            .connections
            .iter()
            .find(|connection| !cell_ids.contains(&connection.from) || !cell_ids.contains(&connection.to))
        {
            return Err(StoreError::DanglingReference {
                from: dangling.from.clone(),
                to: dangling.to.clone(),
            });
        }

        let now = self.clock.now();
        let mut dimensions = bundle.metadata.dimensions;
        let mut batch = WriteBatch::new();
        batch.clear(RecordKind::Cell).clear(RecordKind::Connection);

        for cell in &bundle.cells {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled("import".to_string()));
            }
            if cell.id != cell.position.cell_id() {
                return Err(StoreError::InvalidBundle(format!(
                    "cell {} is stored at position {}",
                    cell.id, cell.position
                )));
            }
            if let Some(grown) = dimensions.grown_to_fit(cell.position, self.config.growth_factor) {
                dimensions = grown;
            }
            batch.put(RecordKind::Cell, cell.id.as_str(), cell.to_bytes()?);
        }
        for connection in &bundle.connections {
            batch.put(RecordKind::Connection, connection.key(), connection.to_bytes()?);
        }

        let ordered_ids: Vec<CellId> = bundle.cells.iter().map(|cell| cell.id.clone()).collect();
        let next = GridMetadata {
            dimensions,
            total_cells: bundle.cells.len() as u64,
            active_workflows: workflow_graph(&ordered_ids, &bundle.connections, &HashSet::new()).workflow_count()
                as u64,
            schema_version: SCHEMA_VERSION.to_string(),
            last_modified: now,
        };
        batch.put(RecordKind::Metadata, METADATA_KEY, serde_json::to_vec(&next)?);

        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled("import".to_string()));
        }

        let mut metadata = self.metadata.write().await;
        self.persistence.apply_batch(batch).await?;
        *metadata = next;
        drop(metadata);

        self.cache().clear();
        self.locks.prune();

        self.emit(GridEvent::SnapshotImported {
            cells: bundle.cells.len(),
            connections: bundle.connections.len(),
        });
        Ok(())
    }

    /// Live statistics. Refreshes the in-memory metadata as a side effect.
    pub async fn statistics(&self) -> StoreResult<GridStatistics> {
        let cell_ids = self.cell_ids().await?;
        let connections = self.load_connections().await?;
        let active_workflows = workflow_graph(&cell_ids, &connections, &HashSet::new()).workflow_count() as u64;

        let memory_usage_bytes = self.persistence.stored_bytes(RecordKind::Cell).await?
            + self.persistence.stored_bytes(RecordKind::Connection).await?;
        let cache_hit_rate = self.cache().hit_rate();
        let now = self.clock.now();

        let mut metadata = self.metadata.write().await;
        metadata.total_cells = cell_ids.len() as u64;
        metadata.active_workflows = active_workflows;
        metadata.last_modified = now;

        Ok(GridStatistics {
            total_cells: metadata.total_cells,
            active_workflows,
            memory_usage_bytes,
            cache_hit_rate,
            dimensions: metadata.dimensions,
            last_update: now,
        })
    }

    pub async fn storage_stats(&self) -> StoreResult<StorageStats> {
        Ok(StorageStats {
            cell_records: self.persistence.record_count(RecordKind::Cell).await?,
            connection_records: self.persistence.record_count(RecordKind::Connection).await?,
            cell_bytes: self.persistence.stored_bytes(RecordKind::Cell).await?,
            connection_bytes: self.persistence.stored_bytes(RecordKind::Connection).await?,
            recovery_records: self.recovery.len().await?,
            cache: self.cache_metrics(),
        })
    }

    /// Reinstate the most recently removed version of a cell. Returns
    /// `false` when nothing was recorded for the id or its coordinate is
    /// occupied again. Connections are not restored.
    pub async fn restore_removed_cell(&self, cell_id: &CellId) -> StoreResult<bool> {
        let Some(record) = self.recovery.latest(cell_id).await? else {
            debug!("No recovery record for {}", cell_id);
            return Ok(false);
        };
        let cell: Cell<P> = record
            .restore()
            .map_err(|e| StoreError::Recovery(format!("Recovery record {} is unreadable: {}", record.key, e)))?;

        let position = cell.position;
        let _guard = self.locks.acquire(position).await;

        if self.cell_exists(&cell.id).await? {
            debug!("Not restoring {}: coordinate is occupied", cell.id);
            return Ok(false);
        }

        let now = self.clock.now();
        let mut metadata = self.metadata.write().await;
        let mut next = metadata.clone();
        if let Some(dimensions) = next.dimensions.grown_to_fit(position, self.config.growth_factor) {
            next.dimensions = dimensions;
        }
        next.total_cells += 1;
        next.last_modified = now;

        let mut batch = WriteBatch::new();
        batch
            .put(RecordKind::Cell, cell.id.as_str(), cell.to_bytes()?)
            .put(RecordKind::Metadata, METADATA_KEY, serde_json::to_vec(&next)?);
        self.persistence.apply_batch(batch).await?;

        *metadata = next;
        drop(metadata);

        self.cache().set(cell.id.as_str(), cell.clone());
        info!("Restored cell {} from {}", cell.id, record.key);
        self.emit(GridEvent::CellRestored { cell_id: cell.id });

        Ok(true)
    }

    /// Run one garbage collection sweep
    pub async fn run_garbage_collection(&self, cancel: &CancellationFlag) -> StoreResult<GarbageCollectionResult> {
        let result = self.gc.sweep(self, cancel).await?;
        self.locks.prune();
        Ok(result)
    }

    /// What a sweep would remove right now, with risky candidates flagged
    pub async fn preview_garbage_collection(&self) -> StoreResult<GarbageCollectionPreview> {
        self.gc.preview(self).await
    }

    /// Recompute and persist the metadata record. Returns `false` without
    /// doing anything when a flush is already running.
    pub async fn flush_metadata(&self) -> StoreResult<bool> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Metadata flush already running, skipping");
            return Ok(false);
        }
        let _guard = FlushGuard(&self.flushing);

        let cell_ids = self.cell_ids().await?;
        let connections = self.load_connections().await?;
        let active_workflows = workflow_graph(&cell_ids, &connections, &HashSet::new()).workflow_count() as u64;

        let mut metadata = self.metadata.write().await;
        let mut next = metadata.clone();
        next.total_cells = cell_ids.len() as u64;
        next.active_workflows = active_workflows;
        next.last_modified = self.clock.now();

        self.persistence
            .put_record(RecordKind::Metadata, METADATA_KEY, serde_json::to_vec(&next)?)
            .await?;
        *metadata = next;

        debug!(
            "Flushed metadata: {} cells, {} workflows",
            metadata.total_cells, metadata.active_workflows
        );
        Ok(true)
    }

    /// Validate the live connection graph. `sources` seed reachability.
    pub async fn validate_workflows(&self, sources: &[CellId]) -> StoreResult<GraphReport> {
        let cell_ids = self.cell_ids().await?;
        let connections = self.load_connections().await?;
        let sources: HashSet<CellId> = sources.iter().cloned().collect();
        Ok(workflow_graph(&cell_ids, &connections, &sources).validate())
    }
}

#[async_trait]
impl<P: Payload> GcTarget for GridStore<P> {
    async fn cell_summaries(&self) -> StoreResult<Vec<CellSummary>> {
        self.persistence
            .list_records(RecordKind::Cell)
            .await?
            .into_iter()
            .map(|(_, data)| -> StoreResult<CellSummary> {
                let stored: StoredCellSummary = serde_json::from_slice(&data)?;
                Ok(CellSummary {
                    id: stored.id,
                    created: stored.created,
                    last_accessed: stored.last_accessed,
                    access_count: stored.access_count,
                    attributes: stored.attributes,
                })
            })
            .collect()
    }

    async fn connected_cell_ids(&self) -> StoreResult<HashSet<CellId>> {
        Ok(self
            .load_connections()
            .await?
            .into_iter()
            .filter(|connection| connection.is_active)
            .flat_map(|connection| [connection.from, connection.to])
            .collect())
    }

    async fn remove_for_gc(
        &self,
        cell_id: &CellId,
        check: &dyn RemovalCheck,
    ) -> StoreResult<Option<RemovalOutcome>> {
        let position = cell_id.position()?;
        let _guard = self.locks.acquire(position).await;
        self.remove_locked(position, RemovalReason::GarbageCollection, Some(check))
            .await
    }
}
