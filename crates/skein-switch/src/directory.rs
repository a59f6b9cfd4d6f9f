//! Read-only view of the storage nodes known to the metadata store

use crate::error::Result;
use crate::plan::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    /// `host:port` of the node's agent server
    pub address: String,
    /// Site or rack the node lives in
    pub location: String,
    /// Measured round-trip delay from the client, if known
    pub delay_ms: Option<u64>,
}

impl NodeInfo {
    pub fn new(id: NodeId, address: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            location: location.into(),
            delay_ms: None,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }
}

#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;
}

/// Directory backed by a fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    nodes: Vec<NodeInfo>,
}

impl StaticDirectory {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl NodeDirectory for StaticDirectory {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes.clone())
    }
}
