//! Stream wrapper that attaches metadata to any async stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tunnel_core::io::AsyncStream;

use crate::address::Metadata;
use crate::traits::Conn;

/// An async stream plus the metadata of its target.
pub struct MetadataConn<S> {
    inner: S,
    metadata: Option<Metadata>,
}

impl<S> MetadataConn<S> {
    pub fn new(inner: S, metadata: Metadata) -> Self {
        Self {
            inner,
            metadata: Some(metadata),
        }
    }

    /// A stream whose target is decided by a higher layer.
    pub fn without_metadata(inner: S) -> Self {
        Self {
            inner,
            metadata: None,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncStream> Conn for MetadataConn<S> {
    fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MetadataConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MetadataConn<S> {
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
