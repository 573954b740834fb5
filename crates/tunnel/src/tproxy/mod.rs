//! Transparent proxy server (Linux only).
//!
//! Accepts TCP connections and UDP datagrams redirected by the kernel
//! (iptables TPROXY or REDIRECT) and recovers the destination each client
//! originally addressed. UDP traffic is split into per-client sessions, see
//! [`session`].

pub mod session;
mod sys;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnel_core::{
    DEFAULT_ADAPTER_QUEUE, DEFAULT_SESSION_ANNOUNCE_QUEUE, DEFAULT_SESSION_QUEUE,
    DEFAULT_TPROXY_INTAKE_QUEUE, DEFAULT_UDP_TIMEOUT_SECS, MAX_PACKET_SIZE,
};

use crate::address::{Address, Metadata, Network};
use crate::conn::MetadataConn;
use crate::error::TunnelError;
use crate::traits::{BoxConn, BoxPacketConn, Overlay, Server};

use session::{Announce, Datagram, Dispatcher, SessionOptions, SessionTable};
pub use session::{ReplySender, TproxyPacketConn};

/// Transparent proxy settings.
#[derive(Debug, Clone)]
pub struct TproxyConfig {
    pub listen: SocketAddr,
    pub udp_timeout: Duration,
    pub session_queue: usize,
}

impl TproxyConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            udp_timeout: Duration::from_secs(DEFAULT_UDP_TIMEOUT_SECS),
            session_queue: DEFAULT_SESSION_QUEUE,
        }
    }
}

/// Server yielding redirected connections with their original destination.
pub struct TproxyServer {
    local_addr: SocketAddr,
    conns: AsyncMutex<mpsc::Receiver<Result<BoxConn, TunnelError>>>,
    packets: AsyncMutex<mpsc::Receiver<Result<BoxPacketConn, TunnelError>>>,
    table: Arc<SessionTable>,
    shutdown: CancellationToken,
}

impl TproxyServer {
    /// Bind the transparent sockets. Requires `CAP_NET_ADMIN`.
    pub fn bind(config: &TproxyConfig, shutdown: &CancellationToken) -> Result<Self, TunnelError> {
        let shutdown = shutdown.child_token();
        let tcp = sys::bind_tcp(config.listen)?;
        let local_addr = tcp.local_addr()?;
        let udp = sys::bind_udp(local_addr)?;
        info!(listen = %local_addr, "tproxy listening");

        let (conn_tx, conn_rx) = mpsc::channel(DEFAULT_ADAPTER_QUEUE);
        tokio::spawn(accept_loop(tcp, local_addr, conn_tx, shutdown.clone()));

        let table = Arc::new(SessionTable::default());
        let (intake_tx, intake_rx) = mpsc::channel(DEFAULT_TPROXY_INTAKE_QUEUE);
        let (announce_tx, announce_rx) = mpsc::channel(DEFAULT_SESSION_ANNOUNCE_QUEUE);
        tokio::spawn(read_loop(udp, intake_tx, announce_tx.clone(), shutdown.clone()));
        let dispatcher = Dispatcher::new(
            table.clone(),
            Arc::new(sys::TransparentReplySender),
            announce_tx,
            SessionOptions {
                idle_timeout: config.udp_timeout,
                queue_capacity: config.session_queue,
            },
            shutdown.clone(),
        );
        tokio::spawn(dispatcher.run(intake_rx));

        Ok(Self {
            local_addr,
            conns: AsyncMutex::new(conn_rx),
            packets: AsyncMutex::new(announce_rx),
            table,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live UDP sessions.
    pub fn session_count(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl Server for TproxyServer {
    async fn accept_conn(&self, _overlay: Option<Overlay>) -> Result<BoxConn, TunnelError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::Closed("tproxy")),
            conn = async { self.conns.lock().await.recv().await } => {
                conn.unwrap_or(Err(TunnelError::Closed("tproxy")))
            }
        }
    }

    async fn accept_packet(&self, _overlay: Option<Overlay>) -> Result<BoxPacketConn, TunnelError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::Closed("tproxy")),
            conn = async { self.packets.lock().await.recv().await } => {
                conn.unwrap_or(Err(TunnelError::Closed("tproxy")))
            }
        }
    }

    fn close(&self) -> Result<(), TunnelError> {
        self.shutdown.cancel();
        Ok(())
    }
}

/// Listening socket of the stream path.
#[async_trait]
pub(crate) trait StreamListener: Send + Sync + 'static {
    async fn accept_redirected(&self) -> io::Result<(TcpStream, SocketAddr)>;

    /// Destination the client addressed before it was redirected.
    fn original_dst(&self, stream: &TcpStream) -> io::Result<SocketAddr>;
}

/// Socket of the datagram path.
#[async_trait]
pub(crate) trait DatagramSocket: Send + Sync + 'static {
    /// Receive one datagram with its source and original destination.
    async fn recv_redirected(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, SocketAddr)>;
}

/// Errors that spoil one datagram but leave the socket usable.
fn is_datagram_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionRefused
    )
}

async fn accept_loop<L: StreamListener>(
    listener: L,
    local_addr: SocketAddr,
    conns: mpsc::Sender<Result<BoxConn, TunnelError>>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = listener.accept_redirected() => res,
        };
        let item = match accepted {
            Ok((stream, peer)) => match listener.original_dst(&stream) {
                Ok(dst) if dst == local_addr => {
                    warn!(peer = %peer, "tproxy connection was not redirected, dropping");
                    continue;
                }
                Ok(dst) => {
                    let metadata = Metadata::new(Address::from_socket_addr(Network::Tcp, dst));
                    info!(peer = %peer, target = %metadata, "tproxy connection accepted");
                    let _ = stream.set_nodelay(true);
                    Ok(Box::new(MetadataConn::new(stream, metadata)) as BoxConn)
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "tproxy original destination unknown");
                    continue;
                }
            },
            Err(e) => {
                error!(error = %e, "tproxy listener failed");
                Err(TunnelError::Listener(e))
            }
        };
        let fatal = item.is_err();
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = conns.send(item) => res,
        };
        if sent.is_err() || fatal {
            break;
        }
    }
    debug!("tproxy accept loop exiting");
}

/// Feed datagrams to the dispatcher. A socket failure is handed to
/// `accept_packet` callers as [`TunnelError::Listener`].
async fn read_loop<S: DatagramSocket>(
    socket: S,
    intake: mpsc::Sender<Datagram>,
    announce: Announce,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = socket.recv_redirected(&mut buf) => res,
        };
        let (n, src, dst) = match received {
            Ok(received) => received,
            Err(e) if is_datagram_error(&e) => {
                warn!(error = %e, "tproxy dropping unreadable datagram");
                tunnel_metrics::record_datagram_dropped("unreadable");
                continue;
            }
            Err(e) => {
                error!(error = %e, "tproxy udp socket failed");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {}
                    _ = announce.send(Err(TunnelError::Listener(e))) => {}
                }
                break;
            }
        };
        let datagram = Datagram {
            src,
            dst,
            payload: Bytes::copy_from_slice(&buf[..n]),
        };
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = intake.send(datagram) => res,
        };
        if sent.is_err() {
            break;
        }
    }
    debug!("tproxy udp reader exiting");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    /// Plain listener whose "original destinations" come from a script.
    struct ScriptedListener {
        inner: TcpListener,
        accepts_left: AtomicUsize,
        destinations: parking_lot::Mutex<VecDeque<io::Result<SocketAddr>>>,
    }

    #[async_trait]
    impl StreamListener for ScriptedListener {
        async fn accept_redirected(&self) -> io::Result<(TcpStream, SocketAddr)> {
            if self.accepts_left.load(Ordering::SeqCst) == 0 {
                return Err(io::Error::other("listener gone"));
            }
            self.accepts_left.fetch_sub(1, Ordering::SeqCst);
            self.inner.accept().await
        }

        fn original_dst(&self, _stream: &TcpStream) -> io::Result<SocketAddr> {
            self.destinations
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::other("script exhausted")))
        }
    }

    type Received = io::Result<(Vec<u8>, SocketAddr, SocketAddr)>;

    struct ScriptedSocket {
        reads: AsyncMutex<mpsc::UnboundedReceiver<Received>>,
    }

    #[async_trait]
    impl DatagramSocket for ScriptedSocket {
        async fn recv_redirected(
            &self,
            buf: &mut [u8],
        ) -> io::Result<(usize, SocketAddr, SocketAddr)> {
            let Some(read) = self.reads.lock().await.recv().await else {
                return std::future::pending().await;
            };
            let (payload, src, dst) = read?;
            buf[..payload.len()].copy_from_slice(&payload);
            Ok((payload.len(), src, dst))
        }
    }

    fn scripted_socket() -> (ScriptedSocket, mpsc::UnboundedSender<Received>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = ScriptedSocket {
            reads: AsyncMutex::new(rx),
        };
        (socket, tx)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_stream_carries_original_destination() {
        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = inner.local_addr().unwrap();
        let listener = ScriptedListener {
            inner,
            accepts_left: AtomicUsize::new(3),
            destinations: parking_lot::Mutex::new(VecDeque::from([
                Ok(local),
                Err(io::Error::other("no destination")),
                Ok(addr("10.0.0.1:80")),
            ])),
        };
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(listener, local, tx, shutdown.clone()));

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(local).await.unwrap());
        }

        let conn = rx.recv().await.unwrap().unwrap();
        let expected = Address::from_socket_addr(Network::Tcp, addr("10.0.0.1:80"));
        assert_eq!(conn.metadata().map(|m| &m.address), Some(&expected));

        // The unredirected and unresolvable connections were closed.
        let mut buf = [0u8; 1];
        assert_eq!(clients[0].read(&mut buf).await.unwrap_or(0), 0);
        assert_eq!(clients[1].read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_listener_error_is_fatal_item() {
        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = inner.local_addr().unwrap();
        let listener = ScriptedListener {
            inner,
            accepts_left: AtomicUsize::new(0),
            destinations: parking_lot::Mutex::new(VecDeque::new()),
        };
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(accept_loop(listener, local, tx, CancellationToken::new()));

        assert!(matches!(rx.recv().await, Some(Err(TunnelError::Listener(_)))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_datagram_is_skipped() {
        let (socket, reads) = scripted_socket();
        let (intake_tx, mut intake_rx) = mpsc::channel(4);
        let (announce_tx, mut announce_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        tokio::spawn(read_loop(socket, intake_tx, announce_tx, shutdown.clone()));

        reads
            .send(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing original destination",
            )))
            .unwrap();
        reads
            .send(Ok((b"query".to_vec(), addr("192.168.1.2:5000"), addr("8.8.8.8:53"))))
            .unwrap();

        let datagram = intake_rx.recv().await.unwrap();
        assert_eq!(datagram.src, addr("192.168.1.2:5000"));
        assert_eq!(datagram.dst, addr("8.8.8.8:53"));
        assert_eq!(&datagram.payload[..], b"query");
        assert!(announce_rx.try_recv().is_err());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_socket_failure_reaches_accept_packet() {
        let (socket, reads) = scripted_socket();
        let (intake_tx, mut intake_rx) = mpsc::channel(4);
        let (announce_tx, mut announce_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        tokio::spawn(read_loop(socket, intake_tx, announce_tx, shutdown.clone()));

        reads.send(Err(io::Error::other("socket gone"))).unwrap();

        assert!(matches!(announce_rx.recv().await, Some(Err(TunnelError::Listener(_)))));
        // The reader is gone; the server's own scope is left to its owner.
        assert!(intake_rx.recv().await.is_none());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_read_loop_stops_on_shutdown() {
        let (socket, _reads) = scripted_socket();
        let (intake_tx, mut intake_rx) = mpsc::channel(4);
        let (announce_tx, mut announce_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let reader = tokio::spawn(read_loop(socket, intake_tx, announce_tx, shutdown.clone()));

        shutdown.cancel();
        reader.await.unwrap();
        assert!(intake_rx.recv().await.is_none());
        assert!(announce_rx.recv().await.is_none());
    }
}
