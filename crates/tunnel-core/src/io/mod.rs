//! I/O utilities for bidirectional relay and stream adapters.
//!
//! This module provides shared I/O primitives used by the relay engine,
//! the protocol-sniffing adapter, and the redirector.

mod relay;
mod rewind;

pub use relay::{NoOpMetrics, RelayEnd, RelayMetrics, relay_bidirectional};
pub use rewind::RewindStream;

use tokio::io::{AsyncRead, AsyncWrite};

/// Marker trait for byte streams that can be relayed and boxed.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}
