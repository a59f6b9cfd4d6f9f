//! Streaming erasure-coding operators

use super::{Outputs, invalid, wait_streams};
use crate::error::{Result, SwitchError};
use crate::stream::read_block;
use crate::switch::Switch;
use crate::var::VarId;
use skein_ec::{ErasureConfig, StripeCoder};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Validated `(k, n, chunk_size)` triple
#[derive(Debug, Clone, Copy)]
pub(crate) struct EcParams {
    coder: StripeCoder,
}

impl EcParams {
    pub(crate) fn new(k: usize, n: usize, chunk_size: usize) -> Result<Self> {
        let config = ErasureConfig::from_k_n(k, n).map_err(|e| invalid("ec", e))?;
        let coder = StripeCoder::new(config, chunk_size).map_err(|e| invalid("ec", e))?;
        Ok(Self { coder })
    }
}

/// Map codec errors, lifting shard shortfalls to the engine-level variant
pub(crate) fn ec_error(e: skein_ec::Error) -> SwitchError {
    match e {
        skein_ec::Error::InsufficientShards {
            available,
            required,
        } => SwitchError::InsufficientShards {
            available,
            required,
        },
        other => SwitchError::Erasure(other),
    }
}

/// Produce the shards `output_indices` from the shards `input_indices`.
///
/// Index sets are checked before anything is read or bound, so a plan with
/// too few inputs fails without exposing any output. Returns after every
/// output has been closed by its consumer.
pub(crate) async fn compute(
    sw: &Arc<Switch>,
    params: EcParams,
    inputs: &[VarId],
    input_indices: &[usize],
    outputs: &[VarId],
    output_indices: &[usize],
) -> Result<()> {
    let coder = params.coder;
    if inputs.len() != input_indices.len() {
        return Err(invalid("ec", "one index per input is required"));
    }
    if outputs.len() != output_indices.len() {
        return Err(invalid("ec", "one index per output is required"));
    }
    coder.check_inputs(input_indices).map_err(ec_error)?;
    coder.check_outputs(output_indices).map_err(ec_error)?;

    let mut streams = wait_streams(sw, inputs).await?;
    let mut out = Outputs::bind(sw, outputs)?;

    let chunk_size = coder.chunk_size();
    let mut blocks = vec![vec![0u8; chunk_size]; streams.len()];
    let mut stripes = 0u64;
    loop {
        let mut ended = 0;
        for (stream, block) in streams.iter_mut().zip(blocks.iter_mut()) {
            let n = read_block(stream, block).await?;
            if n == 0 {
                ended += 1;
            } else if n != chunk_size {
                return Err(SwitchError::Erasure(skein_ec::Error::ShardSizeMismatch {
                    expected: chunk_size,
                    actual: n,
                }));
            }
        }
        if ended == streams.len() {
            break;
        }
        if ended > 0 {
            return Err(SwitchError::Protocol(format!(
                "{} of {} input shards ended early at stripe {}",
                ended,
                streams.len(),
                stripes
            )));
        }

        let present: Vec<(usize, &[u8])> = input_indices
            .iter()
            .copied()
            .zip(blocks.iter().map(|b| b.as_slice()))
            .collect();
        let produced = coder
            .reconstruct_some(&present, output_indices)
            .map_err(ec_error)?;
        for (i, block) in produced.iter().enumerate() {
            out.writer(i).write_all(block).await?;
        }
        stripes += 1;
    }

    debug!(
        plan = %sw.id(),
        at = %sw.location(),
        inputs = ?input_indices,
        outputs = ?output_indices,
        stripes,
        "erasure coding finished"
    );
    drop(streams);
    out.finish().await
}
