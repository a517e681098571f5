//! Append-only log of removed cells
//!
//! Every destructive path (explicit removal and garbage collection) appends
//! a record here before the cell is deleted, so a removal can always be
//! undone by id. The log lives apart from the primary records. A record is
//! only ever withdrawn when the removal it backs up failed to commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{Cell, CellId, Payload, StorageResult};

/// Why a cell was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    GarbageCollection,
    ExplicitRemoval,
}

impl Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::GarbageCollection => f.write_str("garbage_collection"),
            RemovalReason::ExplicitRemoval => f.write_str("explicit_removal"),
        }
    }
}

/// A removed cell as it was right before deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// `removed-{cellId}-{timestampMillis}`
    pub key: String,
    pub cell_id: CellId,
    pub removed_at: DateTime<Utc>,
    pub reason: RemovalReason,
    /// The full cell, serialized
    pub cell: serde_json::Value,
}

impl RecoveryRecord {
    pub fn new<P: Payload>(cell: &Cell<P>, reason: RemovalReason, removed_at: DateTime<Utc>) -> StorageResult<Self> {
        Ok(Self {
            key: Self::key_for(&cell.id, removed_at),
            cell_id: cell.id.clone(),
            removed_at,
            reason,
            cell: serde_json::to_value(cell)?,
        })
    }

    pub fn key_for(cell_id: &CellId, removed_at: DateTime<Utc>) -> String {
        format!("removed-{}-{}", cell_id, removed_at.timestamp_millis())
    }

    /// Decode the stored cell
    pub fn restore<P: Payload>(&self) -> StorageResult<Cell<P>> {
        Ok(serde_json::from_value(self.cell.clone())?)
    }
}

/// Append-only storage for [`RecoveryRecord`]s
#[async_trait]
pub trait RecoveryLog: Send + Sync + Debug {
    /// Append a record. Existing records are never modified.
    async fn append(&self, record: RecoveryRecord) -> StorageResult<()>;

    /// Most recently appended record for a cell
    async fn latest(&self, cell_id: &CellId) -> StorageResult<Option<RecoveryRecord>>;

    /// Every record for a cell, oldest first
    async fn history(&self, cell_id: &CellId) -> StorageResult<Vec<RecoveryRecord>>;

    /// Withdraw the newest record stored under `key`. Only for a removal
    /// whose delete never committed. Returns `false` when nothing matched.
    async fn discard(&self, key: &str) -> StorageResult<bool>;

    /// Total number of records
    async fn len(&self) -> StorageResult<usize>;
}

/// In-memory recovery log
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecoveryLog {
    entries: Arc<RwLock<Vec<RecoveryRecord>>>,
}

impl InMemoryRecoveryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryLog for InMemoryRecoveryLog {
    async fn append(&self, record: RecoveryRecord) -> StorageResult<()> {
        self.entries.write().await.push(record);
        Ok(())
    }

    async fn latest(&self, cell_id: &CellId) -> StorageResult<Option<RecoveryRecord>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().find(|record| &record.cell_id == cell_id).cloned())
    }

    async fn history(&self, cell_id: &CellId) -> StorageResult<Vec<RecoveryRecord>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|record| &record.cell_id == cell_id)
            .cloned()
            .collect())
    }

    async fn discard(&self, key: &str) -> StorageResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.iter().rposition(|record| record.key == key) {
            Some(idx) => {
                entries.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn len(&self) -> StorageResult<usize> {
        Ok(self.entries.read().await.len())
    }
}
