//! Operations: the closed set of steps a switch can run.
//!
//! Every operation declares its input and output variables. It waits for
//! its inputs through the switch, and binds each output before it returns
//! success. An output stream is handed out as a tracked pipe so the
//! producing operation can wait until its consumer has drained it.

mod ec;
mod flow;
mod storage;
pub(crate) mod transfer;

use crate::error::{Result, SwitchError};
use crate::plan::NodeId;
use crate::stream::{DrainSignal, PipeWriter, pipe, track};
use crate::switch::Switch;
use crate::var::{Payload, VarId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Bind a stream written by the driver's caller (`Executor::begin_write`)
    FromDriver { output: VarId },
    /// Expose a stream to the driver's caller (`Executor::begin_read`)
    ToDriver { input: VarId },
    /// Push a stream to the same variable on another node
    SendStream { input: VarId, to: NodeId },
    /// Bind a stream pushed by another switch of the same plan
    ReceiveStream { output: VarId },
    /// Offer a stream for another switch to pull
    ServeStream { input: VarId },
    /// Pull a stream served by a node
    FetchStream { output: VarId, from: NodeId },
    /// Open a blob from the local blob store
    BlobRead { hash: String, output: VarId },
    /// Write a stream into the local blob store, binding its content hash
    BlobWrite { input: VarId, output: VarId },
    /// Publish a scalar under a result key
    Store { input: VarId, key: String },
    /// Fan one stream out to several
    Clone { input: VarId, outputs: Vec<VarId> },
    /// Read a stream to its end and drop it
    Discard { input: VarId },
    /// Pass a stream through once a signal is raised
    HoldUntil {
        signal: VarId,
        input: VarId,
        output: VarId,
    },
    /// Stripe a whole object into `outputs.len()` zero-padded data shards
    ChunkedSplit {
        input: VarId,
        outputs: Vec<VarId>,
        chunk_size: usize,
    },
    /// Interleave data shards back into the object
    ChunkedJoin {
        inputs: Vec<VarId>,
        output: VarId,
        chunk_size: usize,
        size: Option<u64>,
    },
    /// Derive any subset of shards from at least `k` others
    EcCompute {
        k: usize,
        n: usize,
        chunk_size: usize,
        inputs: Vec<VarId>,
        input_indices: Vec<usize>,
        outputs: Vec<VarId>,
        output_indices: Vec<usize>,
    },
    /// Recover the `k` data shards from at least `k` others
    EcReconstruct {
        k: usize,
        n: usize,
        chunk_size: usize,
        inputs: Vec<VarId>,
        input_indices: Vec<usize>,
        outputs: Vec<VarId>,
    },
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::FromDriver { .. } => "from_driver",
            Op::ToDriver { .. } => "to_driver",
            Op::SendStream { .. } => "send_stream",
            Op::ReceiveStream { .. } => "receive_stream",
            Op::ServeStream { .. } => "serve_stream",
            Op::FetchStream { .. } => "fetch_stream",
            Op::BlobRead { .. } => "blob_read",
            Op::BlobWrite { .. } => "blob_write",
            Op::Store { .. } => "store",
            Op::Clone { .. } => "clone",
            Op::Discard { .. } => "discard",
            Op::HoldUntil { .. } => "hold_until",
            Op::ChunkedSplit { .. } => "chunked_split",
            Op::ChunkedJoin { .. } => "chunked_join",
            Op::EcCompute { .. } => "ec_compute",
            Op::EcReconstruct { .. } => "ec_reconstruct",
        }
    }

    pub fn inputs(&self) -> Vec<VarId> {
        match self {
            Op::FromDriver { .. }
            | Op::ReceiveStream { .. }
            | Op::FetchStream { .. }
            | Op::BlobRead { .. } => vec![],
            Op::ToDriver { input }
            | Op::SendStream { input, .. }
            | Op::ServeStream { input }
            | Op::BlobWrite { input, .. }
            | Op::Store { input, .. }
            | Op::Clone { input, .. }
            | Op::Discard { input }
            | Op::ChunkedSplit { input, .. } => vec![*input],
            Op::HoldUntil { signal, input, .. } => vec![*signal, *input],
            Op::ChunkedJoin { inputs, .. }
            | Op::EcCompute { inputs, .. }
            | Op::EcReconstruct { inputs, .. } => inputs.clone(),
        }
    }

    pub fn outputs(&self) -> Vec<VarId> {
        match self {
            Op::ToDriver { .. }
            | Op::SendStream { .. }
            | Op::ServeStream { .. }
            | Op::Store { .. }
            | Op::Discard { .. } => vec![],
            Op::FromDriver { output }
            | Op::ReceiveStream { output }
            | Op::FetchStream { output, .. }
            | Op::BlobRead { output, .. }
            | Op::BlobWrite { output, .. }
            | Op::HoldUntil { output, .. }
            | Op::ChunkedJoin { output, .. } => vec![*output],
            Op::Clone { outputs, .. }
            | Op::ChunkedSplit { outputs, .. }
            | Op::EcCompute { outputs, .. }
            | Op::EcReconstruct { outputs, .. } => outputs.clone(),
        }
    }

    pub(crate) async fn execute(&self, sw: &Arc<Switch>) -> Result<()> {
        match self {
            Op::FromDriver { output } | Op::ReceiveStream { output } => {
                transfer::accept_inbound(sw, *output).await
            }
            Op::ToDriver { input } | Op::ServeStream { input } => {
                transfer::offer_outbound(sw, *input).await
            }
            Op::SendStream { input, to } => transfer::send(sw, *input, *to).await,
            Op::FetchStream { output, from } => transfer::fetch(sw, *output, *from).await,
            Op::BlobRead { hash, output } => storage::blob_read(sw, hash, *output).await,
            Op::BlobWrite { input, output } => storage::blob_write(sw, *input, *output).await,
            Op::Store { input, key } => storage::store(sw, *input, key).await,
            Op::Clone { input, outputs } => flow::clone(sw, *input, outputs).await,
            Op::Discard { input } => flow::discard(sw, *input).await,
            Op::HoldUntil {
                signal,
                input,
                output,
            } => flow::hold_until(sw, *signal, *input, *output).await,
            Op::ChunkedSplit {
                input,
                outputs,
                chunk_size,
            } => flow::split(sw, *input, outputs, *chunk_size).await,
            Op::ChunkedJoin {
                inputs,
                output,
                chunk_size,
                size,
            } => flow::join(sw, inputs, *output, *chunk_size, *size).await,
            Op::EcCompute {
                k,
                n,
                chunk_size,
                inputs,
                input_indices,
                outputs,
                output_indices,
            } => {
                let params = ec::EcParams::new(*k, *n, *chunk_size)?;
                ec::compute(sw, params, inputs, input_indices, outputs, output_indices).await
            }
            Op::EcReconstruct {
                k,
                n,
                chunk_size,
                inputs,
                input_indices,
                outputs,
            } => {
                let params = ec::EcParams::new(*k, *n, *chunk_size)?;
                let data: Vec<usize> = (0..*k).collect();
                ec::compute(sw, params, inputs, input_indices, outputs, &data).await
            }
        }
    }
}

/// Take every input stream at once
pub(crate) async fn wait_streams(sw: &Switch, ids: &[VarId]) -> Result<Vec<crate::stream::ByteStream>> {
    sw.wait_variables(ids)
        .await?
        .into_iter()
        .zip(ids)
        .map(|(payload, id)| payload.into_stream(*id))
        .collect()
}

/// Writers feeding a set of bound output streams
pub(crate) struct Outputs {
    writers: Vec<PipeWriter>,
    drained: Vec<DrainSignal>,
}

impl Outputs {
    /// Create one tracked pipe per output and bind its reading end
    pub(crate) fn bind(sw: &Switch, ids: &[VarId]) -> Result<Self> {
        let depth = sw.context().config().pipe_depth;
        let mut writers = Vec::with_capacity(ids.len());
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            let (writer, reader) = pipe(depth);
            let (reader, signal) = track(Box::new(reader));
            sw.bind_variable(*id, Payload::Stream(reader))?;
            writers.push(writer);
            drained.push(signal);
        }
        Ok(Self { writers, drained })
    }

    pub(crate) fn writer(&mut self, i: usize) -> &mut PipeWriter {
        &mut self.writers[i]
    }

    pub(crate) fn len(&self) -> usize {
        self.writers.len()
    }

    /// Close every writer, then wait for every consumer to drop its end
    pub(crate) async fn finish(self) -> Result<()> {
        for mut writer in self.writers {
            writer.shutdown().await?;
        }
        for signal in self.drained {
            signal.wait().await;
        }
        Ok(())
    }
}

pub(crate) fn invalid(op: &str, msg: impl std::fmt::Display) -> SwitchError {
    SwitchError::InvalidPlan(format!("{}: {}", op, msg))
}
