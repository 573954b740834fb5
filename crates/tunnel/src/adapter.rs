//! One listener shared by SOCKS5 and HTTP proxy clients.
//!
//! Each accepted connection is probed for its first bytes on its own task,
//! rewound, and queued for the overlay that speaks its protocol. A SOCKS5 handshake
//! starts with the version byte `0x05`, which no HTTP method does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_core::io::RewindStream;
use tunnel_core::{
    DEFAULT_ADAPTER_MAX_PROBES, DEFAULT_ADAPTER_QUEUE, DEFAULT_PROBE_TIMEOUT_SECS,
    PROBE_BUFFER_SIZE, PROBE_SIZE, SOCKS5_VERSION,
};

use crate::conn::MetadataConn;
use crate::error::TunnelError;
use crate::freedom::FreedomPacketConn;
use crate::traits::{BoxConn, BoxPacketConn, Overlay, Server};

/// Adapter listener settings.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub listen: SocketAddr,
    pub probe_timeout: Duration,
    pub queue_capacity: usize,
    /// Probes in flight at once; accepting pauses while all are taken.
    pub max_probes: usize,
}

impl AdapterConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            queue_capacity: DEFAULT_ADAPTER_QUEUE,
            max_probes: DEFAULT_ADAPTER_MAX_PROBES,
        }
    }
}

/// Protocol a probed connection is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks,
    Http,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Socks => "socks",
            Protocol::Http => "http",
        }
    }
}

/// Route a connection by the first byte of its probe.
///
/// Only connections starting with the SOCKS5 version byte go to SOCKS, and
/// only once a SOCKS overlay has asked for connections.
pub fn classify(first: u8, socks_enabled: bool) -> Protocol {
    if first == SOCKS5_VERSION && socks_enabled {
        Protocol::Socks
    } else {
        Protocol::Http
    }
}

/// Server that demultiplexes SOCKS5 and HTTP clients on one port.
pub struct AdapterServer {
    local_addr: SocketAddr,
    socks_rx: AsyncMutex<mpsc::Receiver<BoxConn>>,
    http_rx: AsyncMutex<mpsc::Receiver<BoxConn>>,
    socks_enabled: Arc<AtomicBool>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    shutdown: CancellationToken,
}

impl AdapterServer {
    /// Bind the TCP and UDP sockets and start the accept loop.
    pub async fn bind(
        config: &AdapterConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        let udp = UdpSocket::bind(local_addr).await?;
        info!(listen = %local_addr, "adapter listening");

        let shutdown = shutdown.child_token();
        let capacity = config.queue_capacity.max(1);
        let (socks_tx, socks_rx) = mpsc::channel(capacity);
        let (http_tx, http_rx) = mpsc::channel(capacity);
        let socks_enabled = Arc::new(AtomicBool::new(false));

        let router = Arc::new(Router {
            socks_tx,
            http_tx,
            socks_enabled: socks_enabled.clone(),
            probe_timeout: config.probe_timeout,
            shutdown: shutdown.clone(),
        });
        let probes = Arc::new(Semaphore::new(config.max_probes.max(1)));
        tokio::spawn(accept_loop(listener, router, probes));

        Ok(Self {
            local_addr,
            socks_rx: AsyncMutex::new(socks_rx),
            http_rx: AsyncMutex::new(http_rx),
            socks_enabled,
            udp: Mutex::new(Some(Arc::new(udp))),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn next_from(
        &self,
        queue: &AsyncMutex<mpsc::Receiver<BoxConn>>,
    ) -> Result<BoxConn, TunnelError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::Closed("adapter")),
            conn = async { queue.lock().await.recv().await } => {
                conn.ok_or(TunnelError::Closed("adapter"))
            }
        }
    }
}

#[async_trait]
impl Server for AdapterServer {
    async fn accept_conn(&self, overlay: Option<Overlay>) -> Result<BoxConn, TunnelError> {
        match overlay {
            Some(Overlay::Http) => self.next_from(&self.http_rx).await,
            Some(Overlay::Socks) => {
                // Racing SOCKS acceptors may both see the flag set; either
                // one receiving the connection is fine.
                self.socks_enabled.store(true, Ordering::Release);
                self.next_from(&self.socks_rx).await
            }
            other => Err(TunnelError::UnsupportedOverlay(other)),
        }
    }

    /// The shared UDP socket is handed out once; later calls wait for close.
    async fn accept_packet(&self, _overlay: Option<Overlay>) -> Result<BoxPacketConn, TunnelError> {
        let socket = self.udp.lock().take();
        match socket {
            Some(socket) => Ok(Box::new(FreedomPacketConn::new(
                socket,
                self.shutdown.child_token(),
            ))),
            None => {
                self.shutdown.cancelled().await;
                Err(TunnelError::Closed("adapter"))
            }
        }
    }

    fn close(&self) -> Result<(), TunnelError> {
        self.shutdown.cancel();
        self.udp.lock().take();
        Ok(())
    }
}

/// Probes one connection and queues it for its overlay.
struct Router {
    socks_tx: mpsc::Sender<BoxConn>,
    http_tx: mpsc::Sender<BoxConn>,
    socks_enabled: Arc<AtomicBool>,
    probe_timeout: Duration,
    shutdown: CancellationToken,
}

impl Router {
    async fn route(&self, tcp: TcpStream, peer: SocketAddr) {
        let probed = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            res = probe(tcp, self.probe_timeout) => res,
        };
        let (first, stream) = match probed {
            Ok(probed) => probed,
            Err(e) => {
                debug!(peer = %peer, error = %e, "adapter probe failed, dropping connection");
                return;
            }
        };

        let protocol = classify(first, self.socks_enabled.load(Ordering::Acquire));
        debug!(peer = %peer, protocol = protocol.as_str(), "adapter classified connection");
        tunnel_metrics::record_adapter_classified(protocol.as_str());
        let conn: BoxConn = Box::new(MetadataConn::without_metadata(stream));
        let queue = match protocol {
            Protocol::Socks => &self.socks_tx,
            Protocol::Http => &self.http_tx,
        };
        // Waits while the overlay's queue is full.
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            _ = queue.send(conn) => {}
        }
    }
}

async fn accept_loop(listener: TcpListener, router: Arc<Router>, probes: Arc<Semaphore>) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = router.shutdown.cancelled() => break,
            permit = probes.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let (tcp, peer) = tokio::select! {
            biased;
            _ = router.shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "adapter accept error");
                    tunnel_metrics::record_accept_error("adapter");
                    continue;
                }
            },
        };

        let router = router.clone();
        tokio::spawn(async move {
            let _permit = permit;
            router.route(tcp, peer).await;
        });
    }
    debug!("adapter accept loop exiting");
}

/// Read the probe bytes, then rewind them so the consumer sees the full
/// stream. Returns the first byte.
async fn probe(
    tcp: TcpStream,
    timeout: Duration,
) -> std::io::Result<(u8, RewindStream<TcpStream>)> {
    let mut stream = RewindStream::new(tcp, PROBE_BUFFER_SIZE);
    let mut head = [0u8; PROBE_SIZE];
    tokio::time::timeout(timeout, stream.read_exact(&mut head))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "probe timed out"))??;
    stream.rewind()?;
    stream.stop_buffering();
    Ok((head[0], stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn bind_adapter() -> (AdapterServer, CancellationToken) {
        let shutdown = CancellationToken::new();
        let config = AdapterConfig::new("127.0.0.1:0".parse().unwrap());
        let server = AdapterServer::bind(&config, &shutdown).await.unwrap();
        (server, shutdown)
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0x05, true), Protocol::Socks);
        assert_eq!(classify(0x05, false), Protocol::Http);
        assert_eq!(classify(b'G', true), Protocol::Http);
        assert_eq!(classify(b'C', false), Protocol::Http);
    }

    #[tokio::test]
    async fn test_http_connection_is_rewound() {
        let (server, _shutdown) = bind_adapter().await;
        let request = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let mut conn = server.accept_conn(Some(Overlay::Http)).await.unwrap();
        assert!(conn.metadata().is_none());
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_socks_connection_after_socks_accept() {
        let server = Arc::new(bind_adapter().await.0);
        let acceptor = server.clone();
        let accepted =
            tokio::spawn(async move { acceptor.accept_conn(Some(Overlay::Socks)).await });
        while !server.socks_enabled.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        let greeting = [0x05, 0x01, 0x00];
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(&greeting).await.unwrap();

        let mut conn = accepted.await.unwrap().unwrap();
        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, greeting);
    }

    #[tokio::test]
    async fn test_socks_byte_goes_to_http_until_enabled() {
        let (server, _shutdown) = bind_adapter().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let conn = tokio::time::timeout(
            Duration::from_secs(5),
            server.accept_conn(Some(Overlay::Http)),
        )
        .await
        .unwrap();
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_short_probe_is_dropped() {
        let (server, _shutdown) = bind_adapter().await;
        let mut short = TcpStream::connect(server.local_addr()).await.unwrap();
        short.write_all(b"G").await.unwrap();
        drop(short);

        let mut good = TcpStream::connect(server.local_addr()).await.unwrap();
        good.write_all(b"POST / HTTP/1.1\r\n").await.unwrap();

        let mut conn = server.accept_conn(Some(Overlay::Http)).await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"POST");
    }

    #[tokio::test]
    async fn test_silent_client_does_not_stall_others() {
        let (server, _shutdown) = bind_adapter().await;
        let _silent = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::task::yield_now().await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut conn = tokio::time::timeout(
            Duration::from_secs(2),
            server.accept_conn(Some(Overlay::Http)),
        )
        .await
        .expect("waiting behind a silent client")
        .unwrap();
        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET");
    }

    #[tokio::test]
    async fn test_probe_limit_waits_for_free_slot() {
        let shutdown = CancellationToken::new();
        let mut config = AdapterConfig::new("127.0.0.1:0".parse().unwrap());
        config.probe_timeout = Duration::from_millis(200);
        config.max_probes = 1;
        let server = AdapterServer::bind(&config, &shutdown).await.unwrap();

        let _silent = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"PUT / HTTP/1.1\r\n\r\n").await.unwrap();

        // The only slot frees up once the silent probe times out.
        let conn = tokio::time::timeout(
            Duration::from_secs(5),
            server.accept_conn(Some(Overlay::Http)),
        )
        .await
        .unwrap();
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_overlay_is_rejected() {
        let (server, _shutdown) = bind_adapter().await;
        let err = server.accept_conn(None).await.err().unwrap();
        assert!(matches!(err, TunnelError::UnsupportedOverlay(None)));
        let err = server
            .accept_conn(Some(Overlay::Other("shadowsocks")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::UnsupportedOverlay(Some(_))));
    }

    #[tokio::test]
    async fn test_close_unblocks_accepts() {
        let server = Arc::new(bind_adapter().await.0);
        assert!(server.accept_packet(None).await.is_ok());

        let a = server.clone();
        let conn_task = tokio::spawn(async move { a.accept_conn(Some(Overlay::Http)).await });
        let b = server.clone();
        let packet_task = tokio::spawn(async move { b.accept_packet(None).await });
        tokio::task::yield_now().await;

        server.close().unwrap();
        server.close().unwrap();
        assert!(conn_task.await.unwrap().err().unwrap().is_closed());
        assert!(packet_task.await.unwrap().err().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_adapter() {
        let (server, shutdown) = bind_adapter().await;
        shutdown.cancel();
        let err = server.accept_conn(Some(Overlay::Http)).await.err().unwrap();
        assert!(err.is_closed());
    }
}
