//! Wire format for agent connections.
//!
//! Every frame is an 8-byte header followed by `length` payload bytes.
//! Control payloads are MessagePack with named fields; stream bytes travel
//! as raw `DATA` frames terminated by one `END` frame.

use crate::error::{Result, SwitchError};
use crate::plan::PlanId;
use crate::stream::{ByteStream, PipeWriter};
use crate::var::VarId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size (16MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Frame kind identifiers
pub mod frame_kind {
    /// Run a plan; payload is the plan
    pub const EXECUTE: u8 = 0x01;
    /// Push a stream; payload is a `StreamHeader`, data frames follow
    pub const SEND_STREAM: u8 = 0x02;
    /// Pull a stream; payload is a `StreamHeader`
    pub const FETCH_STREAM: u8 = 0x03;

    /// Raw stream bytes
    pub const DATA: u8 = 0x10;
    /// End of stream
    pub const END: u8 = 0x11;

    /// Successful reply; payload depends on the request
    pub const RESULT: u8 = 0x20;
    /// Failed reply; payload is a `WireError`
    pub const ERROR: u8 = 0x40;
}

/// Frame header (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub flags: u8,
    pub reserved: u16,
    pub length: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(kind: u8, length: u32) -> Self {
        Self {
            kind,
            flags: 0,
            reserved: 0,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.reserved);
        buf.put_u32_le(self.length);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(SwitchError::Protocol("incomplete header".into()));
        }
        Ok(Self {
            kind: buf.get_u8(),
            flags: buf.get_u8(),
            reserved: buf.get_u16_le(),
            length: buf.get_u32_le(),
        })
    }
}

/// A decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

/// Names the variable a stream frame sequence belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub plan: PlanId,
    pub var: VarId,
}

pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(payload)?)
}

pub async fn write_frame<W>(w: &mut W, kind: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_SIZE)
        .ok_or_else(|| {
            SwitchError::Protocol(format!("frame payload of {} bytes is too large", payload.len()))
        })?;

    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + payload.len());
    FrameHeader::new(kind, length).encode(&mut buf);
    buf.put_slice(payload);
    w.write_all(&buf).await?;
    Ok(())
}

/// Read one frame. `None` means the peer closed the connection cleanly
/// before a new frame started.
pub async fn read_frame<R>(r: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; FrameHeader::SIZE];
    let mut filled = 0;
    while filled < head.len() {
        let n = r.read(&mut head[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SwitchError::Transport("connection closed inside a frame header".into()));
        }
        filled += n;
    }

    let header = FrameHeader::decode(&mut &head[..])?;
    if header.length > MAX_PAYLOAD_SIZE {
        return Err(SwitchError::Protocol(format!(
            "frame payload of {} bytes exceeds limit",
            header.length
        )));
    }
    let mut payload = vec![0u8; header.length as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        kind: header.kind,
        payload: Bytes::from(payload),
    }))
}

pub async fn write_message<W, T>(w: &mut W, kind: u8, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    write_frame(w, kind, &encode_message(msg)?).await
}

/// Read the reply to a request: `RESULT` decodes as `T`, `ERROR` becomes
/// the remote error.
pub async fn read_reply<R, T>(r: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let frame = read_frame(r)
        .await?
        .ok_or_else(|| SwitchError::Transport("connection closed before reply".into()))?;
    match frame.kind {
        frame_kind::RESULT => decode_message(&frame.payload),
        frame_kind::ERROR => {
            let err: crate::error::WireError = decode_message(&frame.payload)?;
            Err(err.into())
        }
        other => Err(SwitchError::Protocol(format!(
            "unexpected frame kind {:#04x} in reply",
            other
        ))),
    }
}

/// Copy `stream` out as `DATA` frames of at most `chunk` bytes plus `END`
pub async fn write_stream<W>(w: &mut W, mut stream: ByteStream, chunk: usize) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk.clamp(1, MAX_PAYLOAD_SIZE as usize)];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_frame(w, frame_kind::DATA, &buf[..n]).await?;
        total += n as u64;
    }
    write_frame(w, frame_kind::END, &[]).await?;
    w.flush().await?;
    Ok(total)
}

/// Feed `DATA` frames into `writer` until `END`.
///
/// On any failure the writer is dropped unfinished, so its reader sees an
/// error instead of a clean end of stream.
pub async fn read_stream<R>(r: &mut R, mut writer: PipeWriter) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;
    loop {
        let frame = read_frame(r)
            .await?
            .ok_or_else(|| SwitchError::Transport("connection closed mid-stream".into()))?;
        match frame.kind {
            frame_kind::DATA => {
                writer.write_all(&frame.payload).await?;
                total += frame.payload.len() as u64;
            }
            frame_kind::END => {
                writer.shutdown().await?;
                return Ok(total);
            }
            other => {
                return Err(SwitchError::Protocol(format!(
                    "unexpected frame kind {:#04x} in stream",
                    other
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;
    use crate::plan::{NodeId, Plan};
    use crate::stream::{collect, from_bytes, pipe};

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        FrameHeader::new(frame_kind::DATA, 0x0102_0304).encode(&mut buf);
        assert_eq!(&buf[..], &[0x10, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);
        let back = FrameHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(back.length, 0x0102_0304);
    }

    #[test]
    fn test_plan_roundtrip_keeps_op_order() {
        let plan = Plan::new(
            PlanId::new(),
            vec![
                Op::ReceiveStream { output: VarId(1) },
                Op::EcCompute {
                    k: 2,
                    n: 3,
                    chunk_size: 1024,
                    inputs: vec![VarId(1), VarId(2)],
                    input_indices: vec![0, 1],
                    outputs: vec![VarId(3)],
                    output_indices: vec![2],
                },
                Op::SendStream {
                    input: VarId(3),
                    to: NodeId(7),
                },
                Op::ChunkedJoin {
                    inputs: vec![VarId(4)],
                    output: VarId(5),
                    chunk_size: 2,
                    size: None,
                },
                Op::BlobRead {
                    hash: "ab".into(),
                    output: VarId(2),
                },
            ],
        );
        let bytes = encode_message(&plan).unwrap();
        let back: Plan = decode_message(&bytes).unwrap();
        assert_eq!(back, plan);
    }

    #[tokio::test]
    async fn test_stream_framing() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut wire = Vec::new();
        let sent = write_stream(&mut wire, from_bytes(data.clone()), 4096)
            .await
            .unwrap();
        assert_eq!(sent, 10_000);

        let (writer, reader) = pipe(8);
        let mut src = &wire[..];
        let reading = tokio::spawn(collect(Box::new(reader)));
        assert_eq!(read_stream(&mut src, writer).await.unwrap(), 10_000);
        assert_eq!(reading.await.unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame_kind::DATA, b"abc").await.unwrap();

        let (writer, reader) = pipe(8);
        let mut src = &wire[..];
        assert!(read_stream(&mut src, writer).await.is_err());
        assert!(collect(Box::new(reader)).await.is_err());
    }

    #[tokio::test]
    async fn test_error_reply() {
        let mut wire = Vec::new();
        write_message(
            &mut wire,
            frame_kind::ERROR,
            &crate::error::WireError::InsufficientShards {
                available: 1,
                required: 2,
            },
        )
        .await
        .unwrap();
        let mut src = &wire[..];
        let err = read_reply::<_, ()>(&mut src).await.unwrap_err();
        assert!(matches!(
            err,
            SwitchError::InsufficientShards {
                available: 1,
                required: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        let mut buf = BytesMut::new();
        FrameHeader::new(frame_kind::DATA, MAX_PAYLOAD_SIZE + 1).encode(&mut buf);
        wire.extend_from_slice(&buf);
        let mut src = &wire[..];
        assert!(matches!(
            read_frame(&mut src).await,
            Err(SwitchError::Protocol(_))
        ));
    }
}
