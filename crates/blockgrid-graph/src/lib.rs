//! Blockgrid Graph
//!
//! Pure graph algorithms over workflow connections: cycle detection,
//! reachability from source blocks and connected-component partitioning.
//! Nothing in this crate touches storage, so the same validator serves the
//! store's statistics and any external workflow-validation layer.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

mod validator;

pub use validator::{GraphReport, GraphValidator};

/// A node handed to the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node identifier (a cell id when called from the store)
    pub id: String,
    /// Whether traversal for reachability starts here (e.g. an input block)
    pub is_source: bool,
}

impl GraphNode {
    /// Plain, non-source node
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_source: false,
        }
    }

    /// Node that seeds reachability traversal
    pub fn source(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_source: true,
        }
    }
}

/// A directed edge between two node ids
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

impl GraphEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// How serious a validation finding is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks execution of the workflow
    Error,
    /// Reported to the user, execution may proceed
    Warning,
}

/// A single finding produced by [`GraphValidator::validate`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    /// Error code (one of [`error_codes`])
    pub code: &'static str,
    /// Human-readable message
    pub message: String,
    /// Node ids involved, in traversal order
    pub nodes: Vec<String>,
    pub severity: Severity,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.is_empty() {
            write!(f, "{}: {}", self.code, self.message)
        } else {
            write!(f, "{}: {} (nodes: {})", self.code, self.message, self.nodes.join(", "))
        }
    }
}

impl Error for ValidationIssue {}

/// Validation error codes
pub mod error_codes {
    /// A directed cycle exists between blocks
    pub const CIRCULAR_DEPENDENCY: &str = "ERR_GRAPH_CIRCULAR_DEPENDENCY";

    /// A non-source block cannot be reached from any source block
    pub const UNREACHABLE_NODE: &str = "WARN_GRAPH_UNREACHABLE_NODE";

    /// An edge names a node that is not part of the graph
    pub const DANGLING_EDGE: &str = "ERR_GRAPH_DANGLING_EDGE";
}
