//! Direct outbound layer.
//!
//! `FreedomClient` is the innermost client of a stack: it dials targets
//! itself instead of wrapping another layer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::{Address, Metadata, Network};
use crate::conn::MetadataConn;
use crate::error::TunnelError;
use crate::traits::{BoxConn, BoxPacketConn, Client, Overlay, PacketConn};

/// Client that connects straight to the target address.
#[derive(Debug, Clone)]
pub struct FreedomClient {
    shutdown: CancellationToken,
}

impl FreedomClient {
    /// Create a client whose dials are cancelled with `shutdown`.
    pub fn new(shutdown: &CancellationToken) -> Self {
        Self {
            shutdown: shutdown.child_token(),
        }
    }
}

#[async_trait]
impl Client for FreedomClient {
    async fn dial_conn(
        &self,
        address: &Address,
        _overlay: Option<Overlay>,
    ) -> Result<BoxConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed("freedom client"));
        }
        let dial = async {
            let target = address.to_socket_addr().await?;
            let stream = TcpStream::connect(target)
                .await
                .map_err(|source| TunnelError::Dial {
                    target: address.to_string(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            Ok::<_, TunnelError>(stream)
        };
        let stream = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TunnelError::Closed("freedom client")),
            res = dial => res?,
        };
        debug!(target = %address, "freedom dialed");
        let metadata = Metadata::new(address.with_network(Network::Tcp));
        Ok(Box::new(MetadataConn::new(stream, metadata)))
    }

    async fn dial_packet(&self, _overlay: Option<Overlay>) -> Result<BoxPacketConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed("freedom client"));
        }
        let socket = bind_unspecified().await?;
        Ok(Box::new(FreedomPacketConn::new(
            Arc::new(socket),
            self.shutdown.child_token(),
        )))
    }

    fn close(&self) -> Result<(), TunnelError> {
        self.shutdown.cancel();
        Ok(())
    }
}

/// Bind a dual-stack UDP socket, falling back to IPv4 only.
async fn bind_unspecified() -> Result<UdpSocket, TunnelError> {
    match UdpSocket::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)).await {
        Ok(socket) => Ok(socket),
        Err(_) => Ok(UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?),
    }
}

/// A UDP socket exposed as a `PacketConn`.
///
/// Reads report the sender as metadata; writes go to the metadata address.
pub struct FreedomPacketConn {
    socket: Arc<UdpSocket>,
    ipv6: bool,
    closed: CancellationToken,
}

impl FreedomPacketConn {
    pub fn new(socket: Arc<UdpSocket>, closed: CancellationToken) -> Self {
        let ipv6 = socket.local_addr().map(|a| a.is_ipv6()).unwrap_or(false);
        Self {
            socket,
            ipv6,
            closed,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.socket.local_addr()?)
    }

    fn outgoing(&self, target: SocketAddr) -> SocketAddr {
        match target {
            SocketAddr::V4(v4) if self.ipv6 => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            other => other,
        }
    }
}

#[async_trait]
impl PacketConn for FreedomPacketConn {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> Result<(usize, Metadata), TunnelError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TunnelError::Closed("freedom packet conn")),
            res = self.socket.recv_from(buf) => {
                let (n, from) = res?;
                Ok((n, Metadata::new(Address::from_socket_addr(Network::Udp, from))))
            }
        }
    }

    async fn write_with_metadata(
        &self,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<usize, TunnelError> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::Closed("freedom packet conn"));
        }
        let target = self.outgoing(metadata.address().to_socket_addr().await?);
        Ok(self.socket.send_to(payload, target).await?)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_conn_carries_metadata() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let client = FreedomClient::new(&CancellationToken::new());
        let target = Address::from_socket_addr(Network::Tcp, addr);
        let mut conn = client.dial_conn(&target, None).await.unwrap();
        assert_eq!(conn.metadata().unwrap().address(), &target);

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_closed_client_refuses_dial() {
        let client = FreedomClient::new(&CancellationToken::new());
        client.close().unwrap();
        client.close().unwrap();
        let target = Address::from_host(Network::Tcp, "127.0.0.1", 9);
        let err = client.dial_conn(&target, None).await.err().unwrap();
        assert!(err.is_closed());
        assert!(client.dial_packet(None).await.err().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_packet_conn_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let client = FreedomClient::new(&CancellationToken::new());
        let conn = client.dial_packet(None).await.unwrap();
        let metadata = Metadata::new(Address::from_socket_addr(Network::Udp, echo_addr));
        conn.write_with_metadata(b"datagram", &metadata).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = conn.read_with_metadata(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(from, metadata);
    }

    #[tokio::test]
    async fn test_packet_conn_close_unblocks_read() {
        let client = FreedomClient::new(&CancellationToken::new());
        let conn: Arc<dyn PacketConn> = Arc::from(client.dial_packet(None).await.unwrap());
        let reader = conn.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read_with_metadata(&mut buf).await
        });
        tokio::task::yield_now().await;
        conn.close();
        assert!(task.await.unwrap().unwrap_err().is_closed());
    }
}
