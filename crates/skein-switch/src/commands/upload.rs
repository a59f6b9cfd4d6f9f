use super::{BlockInfo, CommandContext, block_hash, block_key};
use crate::directory::NodeInfo;
use crate::error::{Result, SwitchError};
use crate::executor::Executor;
use crate::parser::{FromTo, Parser, Redundancy, Source, Target};
use crate::plan::NodeId;
use crate::stream::ByteStream;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Store an object written by the caller on one node (replica) or on `n`
/// distinct nodes (one erasure-coded shard each)
#[derive(Debug, Clone)]
pub struct UploadObject {
    redundancy: Redundancy,
    affinity: Option<NodeId>,
}

impl UploadObject {
    pub fn new(redundancy: Redundancy) -> Self {
        Self {
            redundancy,
            affinity: None,
        }
    }

    /// Prefer `node` as the upload node
    pub fn with_affinity(mut self, node: NodeId) -> Self {
        self.affinity = Some(node);
        self
    }

    pub async fn execute(
        &self,
        ctx: &CommandContext,
        data: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<Vec<BlockInfo>> {
        let nodes = ctx.nodes().await?;
        let targets = self.choose_targets(&nodes, &ctx.location)?;

        // keep the new blobs safe from collection until they are recorded
        let locks = ctx.lock_blobs(nodes.iter().map(|n| n.id)).await?;
        let result = self.upload(ctx, &targets, data, cancel).await;
        locks.release().await;
        result
    }

    fn choose_targets(&self, nodes: &[NodeInfo], location: &str) -> Result<Vec<NodeId>> {
        let first = choose_upload_node(nodes, location, self.affinity)
            .ok_or_else(|| SwitchError::InvalidPlan("no storage nodes available".into()))?;
        let wanted = match self.redundancy {
            Redundancy::Rep => 1,
            Redundancy::Ec { n, .. } => n,
        };

        let mut rest: Vec<&NodeInfo> = nodes.iter().filter(|n| n.id != first.id).collect();
        rest.sort_by_key(|n| (n.location != location, n.delay_ms.unwrap_or(u64::MAX)));
        let targets: Vec<NodeId> = std::iter::once(first.id)
            .chain(rest.into_iter().map(|n| n.id))
            .take(wanted)
            .collect();
        if targets.len() < wanted {
            return Err(SwitchError::InvalidPlan(format!(
                "need {} storage nodes, {} available",
                wanted,
                targets.len()
            )));
        }
        Ok(targets)
    }

    async fn upload(
        &self,
        ctx: &CommandContext,
        targets: &[NodeId],
        data: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<Vec<BlockInfo>> {
        let indices: Vec<Option<usize>> = match self.redundancy {
            Redundancy::Rep => vec![None],
            Redundancy::Ec { .. } => (0..targets.len()).map(Some).collect(),
        };

        let mut request = FromTo::new().from(Source::driver());
        for (node, index) in targets.iter().zip(&indices) {
            request = request.to(Target::Node {
                node: *node,
                index: *index,
                result_key: block_key(*index),
            });
        }
        let parsed = Parser::new(self.redundancy).parse(&request)?;
        let write = parsed
            .writes
            .first()
            .copied()
            .ok_or_else(|| SwitchError::Internal("upload plan has no driver input".into()))?;

        let exec = Executor::start(parsed.plan, ctx.driver.clone())?;
        let plan_id = exec.plan_id().clone();
        exec.begin_write(write, data)?;
        let results = exec.wait(cancel).await?;

        let blocks = targets
            .iter()
            .zip(indices)
            .map(|(node, index)| {
                Ok(BlockInfo {
                    index,
                    node: *node,
                    hash: block_hash(&results, index)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        info!(plan = %plan_id, blocks = blocks.len(), "object uploaded");
        Ok(blocks)
    }
}

/// Pick the node an upload goes to: the affinity node if it is known, else
/// a random node at the client's location, else the node with the lowest
/// measured delay
pub fn choose_upload_node<'a>(
    nodes: &'a [NodeInfo],
    location: &str,
    affinity: Option<NodeId>,
) -> Option<&'a NodeInfo> {
    if let Some(node) = affinity.and_then(|id| nodes.iter().find(|n| n.id == id)) {
        return Some(node);
    }
    let same: Vec<&NodeInfo> = nodes.iter().filter(|n| n.location == location).collect();
    if let Some(node) = same.choose(&mut rand::thread_rng()) {
        return Some(*node);
    }
    nodes.iter().min_by_key(|n| n.delay_ms.unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<NodeInfo> {
        vec![
            NodeInfo::new(NodeId(1), "a:1", "east").with_delay(40),
            NodeInfo::new(NodeId(2), "b:1", "west").with_delay(5),
            NodeInfo::new(NodeId(3), "c:1", "west"),
            NodeInfo::new(NodeId(4), "d:1", "north").with_delay(20),
        ]
    }

    #[test]
    fn test_affinity_wins() {
        let nodes = nodes();
        let chosen = choose_upload_node(&nodes, "west", Some(NodeId(4))).unwrap();
        assert_eq!(chosen.id, NodeId(4));
    }

    #[test]
    fn test_unknown_affinity_falls_back() {
        let nodes = nodes();
        let chosen = choose_upload_node(&nodes, "east", Some(NodeId(99))).unwrap();
        assert_eq!(chosen.id, NodeId(1));
    }

    #[test]
    fn test_same_location_is_random_among_local() {
        let nodes = nodes();
        for _ in 0..20 {
            let chosen = choose_upload_node(&nodes, "west", None).unwrap();
            assert!(chosen.id == NodeId(2) || chosen.id == NodeId(3));
        }
    }

    #[test]
    fn test_lowest_delay_otherwise() {
        let nodes = nodes();
        let chosen = choose_upload_node(&nodes, "south", None).unwrap();
        assert_eq!(chosen.id, NodeId(2));
        assert!(choose_upload_node(&[], "south", None).is_none());
    }

    #[test]
    fn test_ec_needs_n_nodes() {
        let upload = UploadObject::new(Redundancy::Ec {
            k: 4,
            n: 6,
            chunk_size: 1024,
        });
        let err = upload.choose_targets(&nodes(), "west").unwrap_err();
        assert!(matches!(err, SwitchError::InvalidPlan(_)));

        let upload = UploadObject::new(Redundancy::Ec {
            k: 2,
            n: 3,
            chunk_size: 1024,
        })
        .with_affinity(NodeId(1));
        let targets = upload.choose_targets(&nodes(), "west").unwrap();
        assert_eq!(targets[0], NodeId(1));
        assert_eq!(targets.len(), 3);
        // the rest are ranked by location, then delay
        assert_eq!(&targets[1..], &[NodeId(2), NodeId(3)]);
    }
}
