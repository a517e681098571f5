//! Best-effort live synchronisation of grid writes to other clients

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::debug;

/// Message type of every grid write notification
pub const GRID_UPDATE: &str = "grid-update";

/// Notification pushed after a successful write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    /// Cell id of the written coordinate
    pub key: String,
    /// The written cell, serialized
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SyncMessage {
    pub fn grid_update(key: impl Into<String>, data: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            message_type: GRID_UPDATE.to_string(),
            key: key.into(),
            data,
            timestamp,
        }
    }
}

/// Outbound transport for [`SyncMessage`]s. Delivery is at most once.
#[async_trait]
pub trait LiveSync: Send + Sync + Debug {
    /// Push a message. Errors are reported to the caller, which only logs them.
    async fn publish(&self, message: SyncMessage) -> anyhow::Result<()>;

    /// Whether the transport can currently deliver
    fn is_connected(&self) -> bool;
}

/// [`LiveSync`] over a bounded mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelLiveSync {
    sender: mpsc::Sender<SyncMessage>,
}

impl ChannelLiveSync {
    /// Create a transport and the receiving end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SyncMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl LiveSync for ChannelLiveSync {
    async fn publish(&self, message: SyncMessage) -> anyhow::Result<()> {
        // Never wait on a slow consumer
        self.sender
            .try_send(message)
            .map_err(|e| anyhow::anyhow!("Live sync send failed: {}", e))?;
        debug!("Published live sync message");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
