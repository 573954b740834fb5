//! Relay helpers shared by stream and packet forwarding.

use std::io;

use tracing::warn;
use tunnel::{PacketConn, TunnelError};
use tunnel_core::MAX_PACKET_SIZE;
use tunnel_core::io::RelayMetrics;

/// Records relayed stream bytes in the global metrics.
pub(crate) struct ProxyRelayMetrics;

impl RelayMetrics for ProxyRelayMetrics {
    #[inline]
    fn record_inbound(&self, bytes: u64) {
        tunnel_metrics::record_bytes_inbound(bytes);
    }

    #[inline]
    fn record_outbound(&self, bytes: u64) {
        tunnel_metrics::record_bytes_outbound(bytes);
    }
}

/// Whether a stream error is just the peer going away.
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

/// Copy datagrams from `from` to `to`, each with its own metadata.
///
/// Returns `Ok` when a zero-length datagram marks the end of the session.
/// Datagrams with unusable metadata are dropped.
pub(crate) async fn forward_packets(
    from: &dyn PacketConn,
    to: &dyn PacketConn,
    direction: &'static str,
) -> Result<(), TunnelError> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, metadata) = from.read_with_metadata(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if !metadata.is_valid() {
            warn!(metadata = %metadata, direction, "dropping datagram with invalid metadata");
            tunnel_metrics::record_datagram_dropped("invalid_metadata");
            continue;
        }
        to.write_with_metadata(&buf[..n], &metadata).await?;
        tunnel_metrics::record_packet(direction, n);
    }
}
