//! Per-node execution context injected into every switch

use crate::blob::BlobStore;
use crate::error::{Result, SwitchError};
use crate::plan::{Location, NodeId};
use crate::transport::AgentConnector;
use crate::transport::codec::MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an incoming stream waits for its plan to be registered
    pub find_switch_timeout_ms: u64,
    /// How long `Executor::begin_read` waits for the output to be bound
    pub bind_timeout_ms: u64,
    /// Unread chunks buffered by an in-process pipe
    pub pipe_depth: usize,
    /// Chunk size used when copying streams and framing them on the wire
    pub copy_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            find_switch_timeout_ms: 30_000,
            bind_timeout_ms: 30_000,
            pipe_depth: 16,
            copy_buffer_size: 64 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.find_switch_timeout_ms == 0 {
            return Err(SwitchError::InvalidConfig(
                "find_switch_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.bind_timeout_ms == 0 {
            return Err(SwitchError::InvalidConfig(
                "bind_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.pipe_depth == 0 {
            return Err(SwitchError::InvalidConfig("pipe_depth must be > 0".to_string()));
        }
        if self.copy_buffer_size == 0 || self.copy_buffer_size > MAX_PAYLOAD_SIZE as usize {
            return Err(SwitchError::InvalidConfig(format!(
                "copy_buffer_size must be in 1..={}",
                MAX_PAYLOAD_SIZE
            )));
        }
        Ok(())
    }

    pub fn find_switch_timeout(&self) -> Duration {
        Duration::from_millis(self.find_switch_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn with_find_switch_timeout(mut self, timeout_ms: u64) -> Self {
        self.find_switch_timeout_ms = timeout_ms;
        self
    }

    pub fn with_bind_timeout(mut self, timeout_ms: u64) -> Self {
        self.bind_timeout_ms = timeout_ms;
        self
    }

    pub fn with_pipe_depth(mut self, depth: usize) -> Self {
        self.pipe_depth = depth;
        self
    }

    pub fn with_copy_buffer_size(mut self, size: usize) -> Self {
        self.copy_buffer_size = size;
        self
    }
}

/// Services a switch needs from the process it runs in
pub struct NodeContext {
    node: Option<NodeId>,
    blobs: Option<Arc<dyn BlobStore>>,
    connector: Arc<dyn AgentConnector>,
    config: EngineConfig,
}

impl NodeContext {
    /// Context for the driver side: no local blob store
    pub fn driver(connector: Arc<dyn AgentConnector>, config: EngineConfig) -> Self {
        Self {
            node: None,
            blobs: None,
            connector,
            config,
        }
    }

    /// Context for a storage node
    pub fn node(
        node: NodeId,
        blobs: Arc<dyn BlobStore>,
        connector: Arc<dyn AgentConnector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            node: Some(node),
            blobs: Some(blobs),
            connector,
            config,
        }
    }

    pub fn location(&self) -> Location {
        match self.node {
            Some(node) => Location::Node(node),
            None => Location::Driver,
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node
    }

    pub fn blobs(&self) -> Result<&Arc<dyn BlobStore>> {
        self.blobs
            .as_ref()
            .ok_or_else(|| SwitchError::Blob(format!("no blob store at {}", self.location())))
    }

    pub fn connector(&self) -> &Arc<dyn AgentConnector> {
        &self.connector
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        assert!(EngineConfig::new().with_pipe_depth(0).validate().is_err());
        assert!(EngineConfig::new().with_bind_timeout(0).validate().is_err());
        assert!(
            EngineConfig::new()
                .with_copy_buffer_size(64 * 1024 * 1024)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_durations() {
        let config = EngineConfig::new().with_find_switch_timeout(250);
        assert_eq!(config.find_switch_timeout(), Duration::from_millis(250));
    }
}
