//! Blockgrid Storage
//!
//! Record types for the grid (cells, connections, metadata) and the
//! [`GridPersistence`] contract the store writes through. Records cross the
//! persistence boundary as serialized bytes, so a backend never needs to
//! know the payload type a cell carries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Schema version written into metadata and export bundles
pub const SCHEMA_VERSION: &str = "1.0";

/// Integer grid coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPosition {
    pub x: u32,
    pub y: u32,
}

impl GridPosition {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Identifier of the cell living at this coordinate
    pub fn cell_id(&self) -> CellId {
        CellId::from_position(*self)
    }
}

impl Display for GridPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Cell identifier, always `"x,y"` of the cell's coordinate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn from_position(position: GridPosition) -> Self {
        Self(position.to_string())
    }

    /// Coordinate encoded in the id
    pub fn position(&self) -> StorageResult<GridPosition> {
        let (x, y) = self
            .0
            .split_once(',')
            .ok_or_else(|| StorageError::InvalidCellId(self.0.clone()))?;
        let x = x.trim().parse().map_err(|_| StorageError::InvalidCellId(self.0.clone()))?;
        let y = y.trim().parse().map_err(|_| StorageError::InvalidCellId(self.0.clone()))?;
        Ok(GridPosition { x, y })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CellId {
    type Err = StorageError;

    /// Parses and normalises an id such as `"3, 4"` into `"3,4"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CellId(s.to_string()).position().map(CellId::from_position)
    }
}

impl From<GridPosition> for CellId {
    fn from(position: GridPosition) -> Self {
        Self::from_position(position)
    }
}

/// Anything a cell can carry. Blanket-implemented: the store only needs to
/// clone and (de)serialize payloads, never inspect them.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Classification metadata consulted by eviction and garbage collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellAttributes {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Produced by an automated process rather than authored by a user
    #[serde(default)]
    pub is_generated: bool,
    /// Ids of blocks this block depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl CellAttributes {
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn generated(mut self) -> Self {
        self.is_generated = true;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Case-insensitive match against the category and every tag
    pub fn has_label(&self, label: &str) -> bool {
        self.category
            .iter()
            .chain(self.tags.iter())
            .any(|value| value.eq_ignore_ascii_case(label))
    }
}

/// One stored block record at a grid coordinate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell<P> {
    pub id: CellId,
    pub position: GridPosition,
    pub payload: P,
    /// Starts at 1, incremented on every overwrite of the coordinate
    pub version: u64,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Incremented on every successful read
    pub access_count: u64,
    #[serde(default)]
    pub attributes: CellAttributes,
}

impl<P: Payload> Cell<P> {
    /// A fresh, version 1 cell
    pub fn new(position: GridPosition, payload: P, attributes: CellAttributes, now: DateTime<Utc>) -> Self {
        Self {
            id: position.cell_id(),
            position,
            payload,
            version: 1,
            created: now,
            last_modified: now,
            last_accessed: now,
            access_count: 0,
            attributes,
        }
    }

    /// The cell that replaces `self` on overwrite: same identity and
    /// creation time, next version. Access statistics carry over.
    pub fn overwritten(&self, payload: P, attributes: CellAttributes, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            position: self.position,
            payload,
            version: self.version + 1,
            created: self.created,
            last_modified: now,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            attributes,
        }
    }

    /// Records a successful read
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.access_count += 1;
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Directed relation between two cells, modelling workflow data flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub from: CellId,
    pub to: CellId,
    /// Free-form tag, e.g. "data" or "control"
    #[serde(rename = "type")]
    pub connection_type: String,
    pub created: DateTime<Utc>,
    pub is_active: bool,
    pub weight: f64,
}

impl Connection {
    pub fn new(from: CellId, to: CellId, connection_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            connection_type: connection_type.into(),
            created: now,
            is_active: true,
            weight: 1.0,
        }
    }

    /// Whether either endpoint is `cell_id`
    pub fn touches(&self, cell_id: &CellId) -> bool {
        &self.from == cell_id || &self.to == cell_id
    }

    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Logical grid size. Grows on out-of-bounds writes and never shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDimensions {
    pub width: u32,
    pub height: u32,
}

impl GridDimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, position: GridPosition) -> bool {
        position.x < self.width && position.y < self.height
    }

    /// Dimensions after growing to fit `position`, or `None` when it already
    /// fits or nothing can grow any further.
    ///
    /// An axis only grows when the coordinate reaches past it, to
    /// `ceil(coord * factor)` but at least `coord + 1`. Axes saturate at
    /// `u32::MAX`, so a coordinate of `u32::MAX` is stored without ever
    /// being strictly inside the grid.
    pub fn grown_to_fit(&self, position: GridPosition, factor: f64) -> Option<Self> {
        if self.contains(position) {
            return None;
        }

        fn grow(coord: u32, current: u32, factor: f64) -> u32 {
            if coord < current {
                return current;
            }
            let scaled = (coord as f64 * factor).ceil();
            let scaled = if scaled >= u32::MAX as f64 { u32::MAX } else { scaled as u32 };
            scaled.max(coord.saturating_add(1))
        }

        let grown = Self {
            width: grow(position.x, self.width, factor),
            height: grow(position.y, self.height, factor),
        };
        (grown != *self).then_some(grown)
    }
}

/// Store-wide descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridMetadata {
    pub dimensions: GridDimensions,
    pub total_cells: u64,
    /// Connected components of two or more cells, derived
    pub active_workflows: u64,
    pub schema_version: String,
    pub last_modified: DateTime<Utc>,
}

impl GridMetadata {
    pub fn new(dimensions: GridDimensions, now: DateTime<Utc>) -> Self {
        Self {
            dimensions,
            total_cells: 0,
            active_workflows: 0,
            schema_version: SCHEMA_VERSION.to_string(),
            last_modified: now,
        }
    }
}

/// Key of the single metadata record
pub const METADATA_KEY: &str = "grid";

/// The record families a backend keeps apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    Cell,
    Connection,
    Metadata,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Cell => "cell",
            RecordKind::Connection => "connection",
            RecordKind::Metadata => "metadata",
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put { kind: RecordKind, key: String, data: Vec<u8> },
    Delete { kind: RecordKind, key: String },
    Clear(RecordKind),
}

/// Mutations applied all-or-nothing by [`GridPersistence::apply_batch`].
/// Operations apply in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, kind: RecordKind, key: impl Into<String>, data: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Put {
            kind,
            key: key.into(),
            data,
        });
        self
    }

    pub fn delete(&mut self, kind: RecordKind, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete { kind, key: key.into() });
        self
    }

    pub fn clear(&mut self, kind: RecordKind) -> &mut Self {
        self.ops.push(WriteOp::Clear(kind));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(#[from] anyhow::Error), // Catch-all for backend-specific issues

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid cell id: {0}")]
    InvalidCellId(String),
}

/// Result type for persistence operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Contract for the authoritative record store behind the grid
#[async_trait]
pub trait GridPersistence: Send + Sync + Debug {
    /// Read one record
    async fn get_record(&self, kind: RecordKind, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Insert or replace one record
    async fn put_record(&self, kind: RecordKind, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Delete one record, returning whether it existed
    async fn delete_record(&self, kind: RecordKind, key: &str) -> StorageResult<bool>;

    /// All keys of a kind, in ascending key order
    async fn list_keys(&self, kind: RecordKind) -> StorageResult<Vec<String>>;

    /// All records of a kind, in ascending key order
    async fn list_records(&self, kind: RecordKind) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Apply every operation or none of them
    async fn apply_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Number of records of a kind
    async fn record_count(&self, kind: RecordKind) -> StorageResult<usize> {
        Ok(self.list_keys(kind).await?.len())
    }

    /// Total serialized size of a kind's records
    async fn stored_bytes(&self, kind: RecordKind) -> StorageResult<usize> {
        Ok(self
            .list_records(kind)
            .await?
            .iter()
            .map(|(_, data)| data.len())
            .sum())
    }
}

pub mod clock;
pub mod memory;
pub mod recovery;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::InMemoryGridPersistence;
pub use recovery::{InMemoryRecoveryLog, RecoveryLog, RecoveryRecord, RemovalReason};
