//! Per-peer UDP sessions synthesized from a shared datagram socket.
//!
//! The dispatcher drains raw datagrams, looks up the session of their source
//! address and pushes each datagram onto that session's input queue. The
//! first datagram from a new source creates the session and announces its
//! `PacketConn` exactly once. A companion task per session delivers replies
//! and removes the session after its idle timeout.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::address::{Address, AddressType, Metadata, Network};
use crate::error::TunnelError;
use crate::traits::{BoxPacketConn, PacketConn};

/// A datagram as received by the transparent socket.
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Bytes,
}

/// Delivers a reply to a client so it appears to come from `from`.
#[async_trait]
pub trait ReplySender: Send + Sync + 'static {
    async fn send_reply(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        payload: &[u8],
    ) -> io::Result<usize>;
}

struct Packet {
    metadata: Metadata,
    payload: Bytes,
}

struct Session {
    id: u64,
    src: SocketAddr,
    input: mpsc::Sender<Packet>,
    activity: Notify,
    cancel: CancellationToken,
}

impl Session {
    fn touch(&self) {
        self.activity.notify_one();
    }
}

/// Live sessions keyed by client address.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SocketAddr, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn contains(&self, src: &SocketAddr) -> bool {
        self.sessions.read().contains_key(src)
    }

    fn get(&self, src: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.read().get(src).cloned()
    }

    /// Look up the session for `src`, creating it under the write lock if
    /// missing. Returns `true` when this call created it.
    fn get_or_create(
        &self,
        src: SocketAddr,
        create: impl FnOnce(u64) -> Arc<Session>,
    ) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&src) {
            return (existing.clone(), false);
        }
        let session = create(self.next_id.fetch_add(1, Ordering::Relaxed));
        sessions.insert(src, session.clone());
        (session, true)
    }

    /// Remove `session` unless a newer session already replaced it.
    fn remove(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.src) {
            Some(current) if current.id == session.id => {
                sessions.remove(&session.src);
                true
            }
            _ => false,
        }
    }
}

/// Session tuning shared by every session of one server.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionOptions {
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
}

/// Queue of new sessions, or of the error that ended the datagram path.
pub(crate) type Announce = mpsc::Sender<Result<BoxPacketConn, TunnelError>>;

/// Routes raw datagrams to sessions.
pub(crate) struct Dispatcher<R> {
    table: Arc<SessionTable>,
    replies: Arc<R>,
    announce: Announce,
    options: SessionOptions,
    shutdown: CancellationToken,
}

impl<R: ReplySender> Dispatcher<R> {
    pub fn new(
        table: Arc<SessionTable>,
        replies: Arc<R>,
        announce: Announce,
        options: SessionOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            table,
            replies,
            announce,
            options,
            shutdown,
        }
    }

    pub async fn run(self, mut intake: mpsc::Receiver<Datagram>) {
        loop {
            let datagram = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                datagram = intake.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => break,
                },
            };
            if !self.dispatch(datagram).await {
                break;
            }
        }
        debug!("tproxy dispatcher exiting");
    }

    /// Returns `false` once the server is shutting down.
    async fn dispatch(&self, datagram: Datagram) -> bool {
        let session = match self.table.get(&datagram.src) {
            Some(session) => session,
            None => {
                let mut conn = None;
                let (session, created) = self.table.get_or_create(datagram.src, |id| {
                    let (session, packet_conn) = self.new_session(id, datagram.src);
                    conn = Some(packet_conn);
                    session
                });
                if created && let Some(conn) = conn {
                    info!(peer = %datagram.src, "tproxy udp session created");
                    tunnel_metrics::record_udp_session_created();
                    let conn: BoxPacketConn = Box::new(conn);
                    let announced = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return false,
                        res = self.announce.send(Ok(conn)) => res,
                    };
                    if announced.is_err() {
                        return false;
                    }
                }
                session
            }
        };

        session.touch();
        let packet = Packet {
            metadata: Metadata::new(Address::from_socket_addr(Network::Udp, datagram.dst)),
            payload: datagram.payload,
        };
        match session.input.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %datagram.src, "tproxy udp relay queue full, dropping datagram");
                tunnel_metrics::record_datagram_dropped("queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer = %datagram.src, "tproxy udp session closing, dropping datagram");
            }
        }
        true
    }

    fn new_session(&self, id: u64, src: SocketAddr) -> (Arc<Session>, TproxyPacketConn) {
        let capacity = self.options.queue_capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let session = Arc::new(Session {
            id,
            src,
            input: input_tx,
            activity: Notify::new(),
            cancel: self.shutdown.child_token(),
        });

        tokio::spawn(companion(
            session.clone(),
            output_rx,
            self.table.clone(),
            self.replies.clone(),
            self.options.idle_timeout,
        ));

        let conn = TproxyPacketConn {
            session: session.clone(),
            input: AsyncMutex::new(input_rx),
            output: output_tx,
            table: self.table.clone(),
        };
        (session, conn)
    }
}

/// Deliver replies until the session idles out or is cancelled.
async fn companion<R: ReplySender>(
    session: Arc<Session>,
    mut output: mpsc::Receiver<Packet>,
    table: Arc<SessionTable>,
    replies: Arc<R>,
    idle_timeout: Duration,
) {
    let mut expired = false;
    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            packet = output.recv() => {
                let Some(packet) = packet else { break };
                deliver(&session, packet, replies.as_ref()).await;
            }
            _ = session.activity.notified() => {}
            _ = tokio::time::sleep(idle_timeout) => {
                debug!(peer = %session.src, "tproxy udp session timed out");
                expired = true;
                break;
            }
        }
    }
    if table.remove(&session) {
        tunnel_metrics::record_udp_session_closed(expired);
    }
    session.cancel.cancel();
}

async fn deliver<R: ReplySender + ?Sized>(session: &Session, packet: Packet, replies: &R) {
    let address = packet.metadata.address();
    let from = match (address.address_type(), address.socket_addr()) {
        (AddressType::Ipv4 | AddressType::Ipv6, Some(from)) => from,
        _ => {
            error!(
                peer = %session.src,
                metadata = %packet.metadata,
                "tproxy reply needs an ip source address"
            );
            tunnel_metrics::record_datagram_dropped("invalid_metadata");
            return;
        }
    };
    if let Err(e) = replies.send_reply(from, session.src, &packet.payload).await {
        error!(peer = %session.src, from = %from, error = %e, "tproxy failed to send udp reply");
        return;
    }
    debug!(peer = %session.src, from = %from, len = packet.payload.len(), "tproxy udp reply sent");
}

/// The `PacketConn` of one client session.
///
/// Reads return datagrams the client sent, with their original destination
/// as metadata. Writes deliver replies that appear to come from the
/// metadata address.
pub struct TproxyPacketConn {
    session: Arc<Session>,
    input: AsyncMutex<mpsc::Receiver<Packet>>,
    output: mpsc::Sender<Packet>,
    table: Arc<SessionTable>,
}

impl TproxyPacketConn {
    /// Client address this session belongs to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.session.src
    }
}

#[async_trait]
impl PacketConn for TproxyPacketConn {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> Result<(usize, Metadata), TunnelError> {
        let packet = tokio::select! {
            biased;
            _ = self.session.cancel.cancelled() => {
                return Err(TunnelError::Closed("tproxy session"));
            }
            packet = async { self.input.lock().await.recv().await } => {
                packet.ok_or(TunnelError::Closed("tproxy session"))?
            }
        };
        let n = packet.payload.len().min(buf.len());
        buf[..n].copy_from_slice(&packet.payload[..n]);
        Ok((n, packet.metadata))
    }

    async fn write_with_metadata(
        &self,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<usize, TunnelError> {
        let packet = Packet {
            metadata: metadata.clone(),
            payload: Bytes::copy_from_slice(payload),
        };
        tokio::select! {
            biased;
            _ = self.session.cancel.cancelled() => Err(TunnelError::Closed("tproxy session")),
            res = self.output.send(packet) => match res {
                Ok(()) => Ok(payload.len()),
                Err(_) => Err(TunnelError::Closed("tproxy session")),
            },
        }
    }

    fn close(&self) {
        self.session.cancel.cancel();
        if self.table.remove(&self.session) {
            tunnel_metrics::record_udp_session_closed(false);
        }
    }
}

impl Drop for TproxyPacketConn {
    fn drop(&mut self) {
        self.close();
    }
}
