//! The contract every tunnel layer implements.

use async_trait::async_trait;
use tunnel_core::io::AsyncStream;

use crate::address::{Address, Metadata};
use crate::error::TunnelError;

/// Which overlay protocol is asking a multi-protocol layer for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay {
    Socks,
    Http,
    Other(&'static str),
}

/// An ordered byte stream that knows where it is going.
pub trait Conn: AsyncStream {
    /// Target of this stream, `None` if the layer could not determine one.
    fn metadata(&self) -> Option<&Metadata>;
}

/// Boxed stream connection handed between layers.
pub type BoxConn = Box<dyn Conn>;

/// A datagram endpoint; every datagram carries its own metadata.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Read one datagram into `buf`, returning its length and metadata.
    ///
    /// A datagram longer than `buf` is truncated.
    async fn read_with_metadata(&self, buf: &mut [u8]) -> Result<(usize, Metadata), TunnelError>;

    /// Write one datagram addressed by `metadata`.
    async fn write_with_metadata(
        &self,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<usize, TunnelError>;

    /// Release the endpoint. Idempotent; pending reads return `Closed`.
    fn close(&self);
}

/// Boxed datagram endpoint handed between layers.
pub type BoxPacketConn = Box<dyn PacketConn>;

/// Outbound side of a layer.
#[async_trait]
pub trait Client: Send + Sync {
    async fn dial_conn(
        &self,
        address: &Address,
        overlay: Option<Overlay>,
    ) -> Result<BoxConn, TunnelError>;

    async fn dial_packet(&self, overlay: Option<Overlay>) -> Result<BoxPacketConn, TunnelError>;

    /// Idempotent; blocked dials return `Closed`.
    fn close(&self) -> Result<(), TunnelError>;
}

/// Inbound side of a layer.
#[async_trait]
pub trait Server: Send + Sync {
    /// Wait for the next stream. Returns `Closed` once the server is closed.
    async fn accept_conn(&self, overlay: Option<Overlay>) -> Result<BoxConn, TunnelError>;

    async fn accept_packet(&self, overlay: Option<Overlay>) -> Result<BoxPacketConn, TunnelError>;

    /// Idempotent; blocked accepts return `Closed`.
    fn close(&self) -> Result<(), TunnelError>;
}
