use super::{BlockInfo, CommandContext, LockGuard};
use crate::error::{Result, SwitchError};
use crate::executor::Executor;
use crate::parser::{FromTo, Parser, Redundancy, Source, Target};
use crate::stream::ByteStream;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read an object back from its stored blocks
#[derive(Debug, Clone)]
pub struct DownloadObject {
    redundancy: Redundancy,
    blocks: Vec<BlockInfo>,
    size: u64,
}

impl DownloadObject {
    pub fn new(redundancy: Redundancy, blocks: Vec<BlockInfo>, size: u64) -> Self {
        Self {
            redundancy,
            blocks,
            size,
        }
    }

    /// Start the transfer. The returned reader yields the object's bytes;
    /// call [`ObjectReader::finish`] once done to collect the outcome and
    /// release the locks.
    pub async fn execute(&self, ctx: &CommandContext) -> Result<ObjectReader> {
        let nodes = ctx.nodes().await?;
        let rank: HashMap<_, _> = nodes
            .iter()
            .map(|n| (n.id, (n.location != ctx.location, n.delay_ms.unwrap_or(u64::MAX))))
            .collect();
        let mut usable: Vec<&BlockInfo> = self
            .blocks
            .iter()
            .filter(|b| rank.contains_key(&b.node))
            .collect();

        let chosen: Vec<&BlockInfo> = match self.redundancy {
            Redundancy::Rep => {
                usable.sort_by_key(|b| rank[&b.node]);
                usable.into_iter().take(1).collect()
            }
            Redundancy::Ec { k, .. } => {
                // data shards first: with all of them no decoding is needed
                usable.sort_by_key(|b| b.index);
                usable.dedup_by_key(|b| b.index);
                if usable.len() < k {
                    return Err(SwitchError::InsufficientShards {
                        available: usable.len(),
                        required: k,
                    });
                }
                usable.into_iter().take(k).collect()
            }
        };
        if chosen.is_empty() {
            return Err(SwitchError::NoSource("no reachable replica".into()));
        }

        let locks = ctx.lock_blobs(chosen.iter().map(|b| b.node)).await?;
        let mut request = FromTo::new()
            .to(Target::driver())
            .with_object_size(self.size);
        for block in &chosen {
            request = request.from(Source::Node {
                node: block.node,
                file_hash: block.hash.clone(),
                index: block.index,
            });
        }

        let parsed = match Parser::new(self.redundancy).parse(&request) {
            Ok(parsed) => parsed,
            Err(e) => {
                locks.release().await;
                return Err(e);
            }
        };
        let Some(read) = parsed.reads.first().copied() else {
            locks.release().await;
            return Err(SwitchError::Internal("download plan has no driver output".into()));
        };

        let exec = match Executor::start(parsed.plan, ctx.driver.clone()) {
            Ok(exec) => exec,
            Err(e) => {
                locks.release().await;
                return Err(e);
            }
        };
        match exec.begin_read(read).await {
            Ok(stream) => {
                debug!(plan = %exec.plan_id(), blocks = chosen.len(), "download started");
                Ok(ObjectReader {
                    stream,
                    exec,
                    locks,
                })
            }
            Err(e) => {
                exec.cancel();
                let outcome = exec.wait(&CancellationToken::new()).await;
                locks.release().await;
                match outcome {
                    Err(cause) if !cause.is_abort() => {
                        warn!(error = %cause, read_error = %e, "download plan failed");
                        Err(cause)
                    }
                    _ => Err(e),
                }
            }
        }
    }
}

/// Bytes of a downloading object
pub struct ObjectReader {
    stream: ByteStream,
    exec: Executor,
    locks: LockGuard,
}

impl ObjectReader {
    /// Wait for the plan to finish and release the locks. Finishing before
    /// the object was read to the end fails the plan.
    pub async fn finish(self, cancel: &CancellationToken) -> Result<()> {
        let ObjectReader {
            stream,
            exec,
            locks,
        } = self;
        drop(stream);
        let result = exec.wait(cancel).await;
        locks.release().await;
        result.map(|_| ())
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("plan", self.exec.plan_id())
            .finish()
    }
}
