//! Whole-store export bundles with an integrity signature

use blockgrid_storage::{Cell, Connection, GridMetadata, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};

/// Portable copy of the whole store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle<P> {
    /// Schema version of the exporting store
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub metadata: GridMetadata,
    /// Ordered by cell id
    pub cells: Vec<Cell<P>>,
    /// Ordered by connection id
    pub connections: Vec<Connection>,
    /// Hex SHA-256 over the canonical form of `{cells, connections}`
    pub signature: String,
}

/// The signed part of a bundle
#[derive(Serialize)]
struct SignedContent<'a, P> {
    cells: &'a [Cell<P>],
    connections: &'a [Connection],
}

/// Compute the signature of a cell and connection list.
///
/// Canonical form is the compact JSON of the content with object keys
/// sorted, so the digest does not depend on struct field order.
pub fn compute_signature<P: Payload>(cells: &[Cell<P>], connections: &[Connection]) -> StoreResult<String> {
    let canonical = serde_json::to_value(SignedContent { cells, connections })?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

impl<P: Payload> ExportBundle<P> {
    /// Build a signed bundle
    pub fn new(
        version: impl Into<String>,
        exported_at: DateTime<Utc>,
        metadata: GridMetadata,
        cells: Vec<Cell<P>>,
        connections: Vec<Connection>,
    ) -> StoreResult<Self> {
        let signature = compute_signature(&cells, &connections)?;
        Ok(Self {
            version: version.into(),
            exported_at,
            metadata,
            cells,
            connections,
            signature,
        })
    }

    /// Recompute the signature and compare it with the carried one
    pub fn verify(&self) -> StoreResult<()> {
        let actual = compute_signature(&self.cells, &self.connections)?;
        if actual != self.signature {
            return Err(StoreError::Integrity {
                expected: self.signature.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
