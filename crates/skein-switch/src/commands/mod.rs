//! High-level transfers built on the parser and the executor.
//!
//! Each command resolves its nodes through the [`NodeDirectory`], takes
//! blob-store `busy` locks on every node it touches, runs one plan and
//! releases the locks whatever the outcome.

mod download;
mod repair;
mod upload;

pub use download::{DownloadObject, ObjectReader};
pub use repair::RepairBlocks;
pub use upload::{UploadObject, choose_upload_node};

use crate::context::NodeContext;
use crate::directory::{NodeDirectory, NodeInfo};
use crate::error::{Result, SwitchError};
use crate::lock::{LockRequestBuilder, LockRequestId, LockService};
use crate::plan::NodeId;
use crate::switch::Results;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Where one stored block of an object lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Shard index, `None` for a whole-object replica
    pub index: Option<usize>,
    pub node: NodeId,
    pub hash: String,
}

/// Services shared by every command
#[derive(Clone)]
pub struct CommandContext {
    pub directory: Arc<dyn NodeDirectory>,
    pub locks: Arc<dyn LockService>,
    /// Driver-side context the plans execute under
    pub driver: Arc<NodeContext>,
    /// Location of the client, matched against [`NodeInfo::location`]
    pub location: String,
}

impl CommandContext {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        locks: Arc<dyn LockService>,
        driver: Arc<NodeContext>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            locks,
            driver,
            location: location.into(),
        }
    }

    pub(crate) async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self.directory.list_nodes().await?;
        if nodes.is_empty() {
            return Err(SwitchError::InvalidPlan("no storage nodes available".into()));
        }
        Ok(nodes)
    }

    /// Take `busy` locks on the blob stores of `nodes`
    pub(crate) async fn lock_blobs(
        &self,
        nodes: impl IntoIterator<Item = NodeId>,
    ) -> Result<LockGuard> {
        let builder = nodes
            .into_iter()
            .fold(LockRequestBuilder::new(), |b, node| b.blob_busy(node));
        let id = builder.acquire(self.locks.as_ref()).await?;
        Ok(LockGuard {
            service: self.locks.clone(),
            id: Some(id),
        })
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("location", &self.location)
            .finish()
    }
}

/// Held distributed locks. Released explicitly with [`release`](Self::release),
/// or in the background when dropped.
pub(crate) struct LockGuard {
    service: Arc<dyn LockService>,
    id: Option<LockRequestId>,
}

impl LockGuard {
    pub(crate) async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.service.release(id).await {
                warn!(request = id.0, error = %e, "failed to release locks");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else { return };
        let service = self.service.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = service.release(id).await {
                        warn!(request = id.0, error = %e, "failed to release locks");
                    }
                });
            }
            Err(_) => warn!(request = id.0, "locks leaked: no runtime to release them"),
        }
    }
}

/// Result key under which block `index` publishes its hash
pub(crate) fn block_key(index: Option<usize>) -> String {
    match index {
        Some(i) => format!("block-{}", i),
        None => "block".to_string(),
    }
}

pub(crate) fn block_hash(results: &Results, index: Option<usize>) -> Result<String> {
    let key = block_key(index);
    results
        .get(&key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SwitchError::Internal(format!("plan produced no result {}", key)))
}
