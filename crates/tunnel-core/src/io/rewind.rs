//! Rewindable stream adapter for protocol detection.
//!
//! `RewindStream` records the bytes read from the inner stream while
//! buffering is enabled. After `rewind()`, those bytes are replayed to the
//! next reader before any fresh data, so a probe can inspect the head of a
//! connection without consuming it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream wrapper that can replay the bytes it has already yielded.
///
/// # Example
///
/// ```ignore
/// use tokio::io::AsyncReadExt;
/// use tunnel_core::io::RewindStream;
///
/// let mut stream = RewindStream::new(tcp_stream, 16);
/// let mut probe = [0u8; 3];
/// stream.read_exact(&mut probe).await?;
/// stream.rewind()?;
/// stream.stop_buffering();
/// // The next reader sees the probe bytes again.
/// ```
pub struct RewindStream<S> {
    inner: S,
    buf: BytesMut,
    /// Replay position in `buf`; equals `buf.len()` when nothing is pending.
    pos: usize,
    limit: usize,
    buffering: bool,
    overflowed: bool,
}

impl<S> RewindStream<S> {
    /// Create a new rewindable stream that records at most `limit` bytes.
    pub fn new(inner: S, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(limit),
            pos: 0,
            limit,
            buffering: true,
            overflowed: false,
        }
    }

    /// Replay every recorded byte on the following reads.
    ///
    /// Fails if more than `limit` bytes were read while buffering, since the
    /// head of the stream can no longer be reproduced.
    pub fn rewind(&mut self) -> io::Result<()> {
        if self.overflowed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "rewind buffer overflowed",
            ));
        }
        self.pos = 0;
        Ok(())
    }

    /// Stop recording; bytes already recorded are still replayed.
    pub fn stop_buffering(&mut self) {
        self.buffering = false;
        if self.pos >= self.buf.len() {
            self.buf = BytesMut::new();
            self.pos = 0;
        }
    }

    /// Number of recorded bytes that will be replayed before fresh data.
    pub fn pending_replay(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Returns a reference to the inner stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.pos < this.buf.len() {
            let remaining = &this.buf[this.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            this.pos += to_copy;
            if !this.buffering && this.pos >= this.buf.len() {
                this.buf = BytesMut::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if this.buffering {
                    let fresh = &buf.filled()[before..];
                    if this.buf.len() + fresh.len() > this.limit {
                        this.overflowed = true;
                        this.buffering = false;
                        this.buf = BytesMut::new();
                    } else {
                        this.buf.extend_from_slice(fresh);
                    }
                    this.pos = this.buf.len();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
