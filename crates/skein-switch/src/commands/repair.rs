use super::{BlockInfo, CommandContext, block_hash, block_key};
use crate::error::{Result, SwitchError};
use crate::executor::Executor;
use crate::parser::{FromTo, Parser, Redundancy, Source, Target};
use crate::plan::NodeId;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Recompute lost erasure-coded blocks from healthy ones and store them on
/// new nodes. The data never passes through the driver.
#[derive(Debug, Clone)]
pub struct RepairBlocks {
    redundancy: Redundancy,
    healthy: Vec<BlockInfo>,
    repairs: Vec<(usize, NodeId)>,
}

impl RepairBlocks {
    pub fn new(redundancy: Redundancy, healthy: Vec<BlockInfo>) -> Self {
        Self {
            redundancy,
            healthy,
            repairs: Vec::new(),
        }
    }

    /// Rebuild block `index` on `node`
    pub fn repair(mut self, index: usize, node: NodeId) -> Self {
        self.repairs.push((index, node));
        self
    }

    pub async fn execute(
        &self,
        ctx: &CommandContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<BlockInfo>> {
        let Redundancy::Ec { k, .. } = self.redundancy else {
            return Err(SwitchError::InvalidPlan(
                "only erasure-coded blocks can be repaired".into(),
            ));
        };
        if self.repairs.is_empty() {
            return Ok(Vec::new());
        }

        let mut sources: Vec<&BlockInfo> = self.healthy.iter().filter(|b| b.index.is_some()).collect();
        sources.sort_by_key(|b| b.index);
        sources.dedup_by_key(|b| b.index);
        if sources.len() < k {
            return Err(SwitchError::InsufficientShards {
                available: sources.len(),
                required: k,
            });
        }
        sources.truncate(k);

        let involved: BTreeSet<NodeId> = sources
            .iter()
            .map(|b| b.node)
            .chain(self.repairs.iter().map(|(_, node)| *node))
            .collect();
        let locks = ctx.lock_blobs(involved).await?;
        let result = self.run(ctx, &sources, cancel).await;
        locks.release().await;
        result
    }

    async fn run(
        &self,
        ctx: &CommandContext,
        sources: &[&BlockInfo],
        cancel: &CancellationToken,
    ) -> Result<Vec<BlockInfo>> {
        let mut request = FromTo::new();
        for block in sources {
            request = request.from(Source::Node {
                node: block.node,
                file_hash: block.hash.clone(),
                index: block.index,
            });
        }
        for (index, node) in &self.repairs {
            request = request.to(Target::node_shard(*node, *index, block_key(Some(*index))));
        }

        let parsed = Parser::new(self.redundancy).parse(&request)?;
        let exec = Executor::start(parsed.plan, ctx.driver.clone())?;
        let plan_id = exec.plan_id().clone();
        let results = exec.wait(cancel).await?;

        let blocks = self
            .repairs
            .iter()
            .map(|(index, node)| {
                Ok(BlockInfo {
                    index: Some(*index),
                    node: *node,
                    hash: block_hash(&results, Some(*index))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        info!(plan = %plan_id, repaired = blocks.len(), "blocks repaired");
        Ok(blocks)
    }
}
