//! Moving streams across the switch boundary

use crate::error::{Result, SwitchError};
use crate::plan::NodeId;
use crate::stream::track;
use crate::switch::Switch;
use crate::var::{Payload, VarId};
use std::sync::Arc;
use tracing::debug;

/// Bind a stream that arrives through the inbound port
pub(super) async fn accept_inbound(sw: &Arc<Switch>, output: VarId) -> Result<()> {
    let stream = sw.take_inbound(output).await?;
    sw.bind_variable(output, Payload::Stream(stream))
}

/// Put a stream on the outbound port and wait until the taker drops it.
///
/// Dropping the stream before reading it to the end fails the operation.
pub(super) async fn offer_outbound(sw: &Arc<Switch>, input: VarId) -> Result<()> {
    let stream = sw.wait_stream(input).await?;
    let (stream, drained) = track(stream);
    sw.offer_outbound(input, stream)?;
    if drained.wait().await {
        debug!(plan = %sw.id(), var = %input, "outbound stream drained");
        return Ok(());
    }
    if sw.is_cancelled() {
        return Err(sw.abort_error());
    }
    Err(SwitchError::Transport(format!(
        "stream {} was dropped before its end",
        input
    )))
}

pub(super) async fn send(sw: &Arc<Switch>, input: VarId, to: NodeId) -> Result<()> {
    let stream = sw.wait_stream(input).await?;
    let client = sw
        .context()
        .connector()
        .connect(to)
        .await
        .map_err(|e| dispatch_error(to, e))?;

    debug!(plan = %sw.id(), var = %input, to = %to, "sending stream");
    client
        .send_stream(sw.id(), input, stream)
        .await
        .map_err(|e| dispatch_error(to, e))
}

pub(super) async fn fetch(sw: &Arc<Switch>, output: VarId, from: NodeId) -> Result<()> {
    let client = sw
        .context()
        .connector()
        .connect(from)
        .await
        .map_err(|e| dispatch_error(from, e))?;

    debug!(plan = %sw.id(), var = %output, from = %from, "fetching stream");
    let stream = client
        .fetch_stream(sw.id(), output)
        .await
        .map_err(|e| dispatch_error(from, e))?;
    sw.bind_variable(output, Payload::Stream(stream))
}

/// Failures talking to `node` become `DispatchFailed`; aborts pass through
pub(crate) fn dispatch_error(node: NodeId, e: SwitchError) -> SwitchError {
    match e {
        SwitchError::DispatchFailed { .. } => e,
        e if e.is_abort() => e,
        e => SwitchError::DispatchFailed {
            node,
            reason: e.to_string(),
        },
    }
}
