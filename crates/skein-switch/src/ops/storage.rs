//! Blob store and result map boundary

use crate::error::Result;
use crate::switch::Switch;
use crate::var::{Payload, Value, VarId};
use std::sync::Arc;
use tracing::debug;

pub(super) async fn blob_read(sw: &Arc<Switch>, hash: &str, output: VarId) -> Result<()> {
    let stream = sw.context().blobs()?.open_read(hash).await?;
    sw.bind_variable(output, Payload::Stream(stream))
}

pub(super) async fn blob_write(sw: &Arc<Switch>, input: VarId, output: VarId) -> Result<()> {
    let stream = sw.wait_stream(input).await?;
    let hash = sw.context().blobs()?.create_file(stream).await?;
    debug!(plan = %sw.id(), at = %sw.location(), hash = %hash, "blob written");
    sw.bind_variable(output, Payload::Scalar(Value::Str(hash)))
}

pub(super) async fn store(sw: &Arc<Switch>, input: VarId, key: &str) -> Result<()> {
    let value = sw.wait_scalar(input).await?;
    sw.store_result(key.to_string(), value);
    Ok(())
}
