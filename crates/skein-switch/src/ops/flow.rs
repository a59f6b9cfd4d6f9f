//! Stream plumbing: fan-out, drain, gating, striping

use super::{Outputs, invalid, wait_streams};
use crate::error::{Result, SwitchError};
use crate::stream::{drain, read_block};
use crate::switch::Switch;
use crate::var::{Payload, VarId};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub(super) async fn clone(sw: &Arc<Switch>, input: VarId, outputs: &[VarId]) -> Result<()> {
    let mut stream = sw.wait_stream(input).await?;
    let mut out = Outputs::bind(sw, outputs)?;

    let mut buf = vec![0u8; sw.context().config().copy_buffer_size];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for i in 0..out.len() {
            out.writer(i).write_all(&buf[..n]).await?;
        }
    }
    drop(stream);
    out.finish().await
}

pub(super) async fn discard(sw: &Arc<Switch>, input: VarId) -> Result<()> {
    let mut stream = sw.wait_stream(input).await?;
    let bytes = drain(&mut stream).await?;
    debug!(plan = %sw.id(), var = %input, bytes, "stream discarded");
    Ok(())
}

pub(super) async fn hold_until(
    sw: &Arc<Switch>,
    signal: VarId,
    input: VarId,
    output: VarId,
) -> Result<()> {
    if !sw.wait_signal(signal).await? {
        debug!(plan = %sw.id(), var = %signal, "hold released with false");
        return Err(SwitchError::Cancelled);
    }
    let stream = sw.wait_stream(input).await?;
    sw.bind_variable(output, Payload::Stream(stream))
}

pub(super) async fn split(
    sw: &Arc<Switch>,
    input: VarId,
    outputs: &[VarId],
    chunk_size: usize,
) -> Result<()> {
    if outputs.is_empty() || chunk_size == 0 {
        return Err(invalid("chunked_split", "needs outputs and a chunk size"));
    }
    let mut stream = sw.wait_stream(input).await?;
    let mut out = Outputs::bind(sw, outputs)?;

    let stripe_size = chunk_size * outputs.len();
    let mut stripe = vec![0u8; stripe_size];
    let mut total = 0u64;
    loop {
        let n = read_block(&mut stream, &mut stripe).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        stripe[n..].fill(0);
        for (i, chunk) in stripe.chunks(chunk_size).enumerate() {
            out.writer(i).write_all(chunk).await?;
        }
        if n < stripe_size {
            break;
        }
    }
    debug!(plan = %sw.id(), var = %input, bytes = total, "object split");
    drop(stream);
    out.finish().await
}

pub(super) async fn join(
    sw: &Arc<Switch>,
    inputs: &[VarId],
    output: VarId,
    chunk_size: usize,
    size: Option<u64>,
) -> Result<()> {
    if inputs.is_empty() || chunk_size == 0 {
        return Err(invalid("chunked_join", "needs inputs and a chunk size"));
    }
    let mut streams = wait_streams(sw, inputs).await?;
    let mut out = Outputs::bind(sw, &[output])?;

    let mut remaining = size.unwrap_or(u64::MAX);
    let mut chunk = vec![0u8; chunk_size];
    'stripes: loop {
        for (i, stream) in streams.iter_mut().enumerate() {
            let n = read_block(stream, &mut chunk).await?;
            if n == 0 && i == 0 {
                break 'stripes;
            }
            if n != chunk_size {
                return Err(skein_ec::Error::ShardSizeMismatch {
                    expected: chunk_size,
                    actual: n,
                }
                .into());
            }
            let take = remaining.min(n as u64) as usize;
            if take > 0 {
                out.writer(0).write_all(&chunk[..take]).await?;
                remaining -= take as u64;
            }
        }
    }
    for stream in streams.iter_mut().skip(1) {
        let extra = drain(stream).await?;
        if extra > 0 {
            return Err(skein_ec::Error::ShardSizeMismatch {
                expected: 0,
                actual: extra as usize,
            }
            .into());
        }
    }

    if let Some(size) = size {
        if remaining > 0 {
            return Err(SwitchError::Protocol(format!(
                "shards hold {} bytes, expected {}",
                size - remaining,
                size
            )));
        }
    }
    drop(streams);
    out.finish().await
}
