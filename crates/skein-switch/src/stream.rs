//! Byte streams moved between operations, switches and nodes.
//!
//! Streams inside a switch are connected with [`pipe`], a bounded channel of
//! [`Bytes`] chunks. A writer that is dropped without `shutdown()` makes the
//! reader fail with `UnexpectedEof`, so a producer that dies mid-stream can
//! never be mistaken for a short but complete one.

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;

/// Owned, readable byte sequence. Closing is dropping.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Stream over an in-memory buffer
pub fn from_bytes(data: impl Into<Bytes>) -> ByteStream {
    Box::new(io::Cursor::new(data.into()))
}

/// Create a bounded pipe holding at most `depth` unread chunks
pub fn pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let finished = Arc::new(AtomicBool::new(false));
    (
        PipeWriter {
            tx: PollSender::new(tx),
            finished: finished.clone(),
        },
        PipeReader {
            rx,
            finished,
            pending: Bytes::new(),
        },
    )
}

/// Writing half of a [`pipe`]
pub struct PipeWriter {
    tx: PollSender<Bytes>,
    finished: Arc<AtomicBool>,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.tx.poll_reserve(cx)).map_err(|_| reader_gone())?;
        self.tx
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| reader_gone())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.finished.store(true, Ordering::Release);
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

fn reader_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
}

/// Reading half of a [`pipe`]
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    finished: Arc<AtomicBool>,
    pending: Bytes,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(chunk) => self.pending = chunk,
                None if self.finished.load(Ordering::Acquire) => return Poll::Ready(Ok(())),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pipe writer dropped before end of stream",
                    )));
                }
            }
        }
    }
}

/// Wrap `stream` so the returned [`DrainSignal`] fires once it is dropped.
pub fn track(stream: ByteStream) -> (ByteStream, DrainSignal) {
    let (tx, rx) = oneshot::channel();
    let tracked = TrackedStream {
        inner: stream,
        eof: false,
        tx: Some(tx),
    };
    (Box::new(tracked), DrainSignal(rx))
}

struct TrackedStream {
    inner: ByteStream,
    eof: bool,
    tx: Option<oneshot::Sender<bool>>,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let wants = buf.remaining() > 0;
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        if wants && buf.filled().len() == before {
            self.eof = true;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(self.eof);
        }
    }
}

/// Completes when a tracked stream is dropped by its consumer
pub struct DrainSignal(oneshot::Receiver<bool>);

impl DrainSignal {
    /// Wait for the consumer to drop the stream. Returns whether it had read
    /// up to end of stream first.
    pub async fn wait(self) -> bool {
        self.0.await.unwrap_or(false)
    }
}

/// Read until `buf` is full or the stream ends, returning the bytes read
pub async fn read_block(stream: &mut ByteStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read and discard everything, returning the byte count
pub async fn drain(stream: &mut ByteStream) -> io::Result<u64> {
    tokio::io::copy(stream, &mut tokio::io::sink()).await
}

/// Read a whole stream into memory
pub async fn collect(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    Ok(out)
}
