//! Metrics collection and Prometheus exporter for tunnel-rs.
//!
//! Recording helpers go through the `metrics` facade, so they are no-ops
//! until an exporter is installed with [`init_prometheus`].

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize Prometheus metrics exporter.
///
/// Starts an HTTP server on the given address to expose metrics.
/// Returns an error message if binding fails.
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {}", e))?;

    Ok(())
}

// ============================================================================
// Metric Names
// ============================================================================

/// Total number of relays started, labelled by kind ("stream" or "packet").
pub const RELAYS_TOTAL: &str = "tunnel_relays_total";
/// Number of relays currently running, labelled by kind.
pub const RELAYS_ACTIVE: &str = "tunnel_relays_active";
/// Relay duration histogram (seconds), labelled by kind.
pub const RELAY_DURATION_SECONDS: &str = "tunnel_relay_duration_seconds";
/// Bytes copied from a source to the sink.
pub const BYTES_INBOUND_TOTAL: &str = "tunnel_bytes_inbound_total";
/// Bytes copied from the sink back to a source.
pub const BYTES_OUTBOUND_TOTAL: &str = "tunnel_bytes_outbound_total";
/// Datagrams relayed, labelled by direction.
pub const PACKETS_TOTAL: &str = "tunnel_packets_total";
/// Failed sink dials, labelled by kind.
pub const DIAL_FAILURES_TOTAL: &str = "tunnel_dial_failures_total";
/// Transient accept errors, labelled by kind.
pub const ACCEPT_ERRORS_TOTAL: &str = "tunnel_accept_errors_total";
/// Connections classified by the adapter, labelled by protocol.
pub const ADAPTER_CLASSIFIED_TOTAL: &str = "tunnel_adapter_classified_total";
/// Total number of UDP sessions created.
pub const UDP_SESSIONS_TOTAL: &str = "tunnel_udp_sessions_total";
/// Number of live UDP sessions.
pub const UDP_SESSIONS_ACTIVE: &str = "tunnel_udp_sessions_active";
/// UDP sessions removed after their idle timeout.
pub const UDP_SESSIONS_EXPIRED_TOTAL: &str = "tunnel_udp_sessions_expired_total";
/// Datagrams dropped, labelled by reason.
pub const DATAGRAMS_DROPPED_TOTAL: &str = "tunnel_datagrams_dropped_total";
/// Redirections, labelled by outcome.
pub const REDIRECTS_TOTAL: &str = "tunnel_redirects_total";
/// Total number of errors by type.
pub const ERRORS_TOTAL: &str = "tunnel_errors_total";

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a relay started (kind: "stream" or "packet").
#[inline]
pub fn record_relay_started(kind: &'static str) {
    counter!(RELAYS_TOTAL, "kind" => kind).increment(1);
    gauge!(RELAYS_ACTIVE, "kind" => kind).increment(1.0);
}

/// Record a relay finished.
#[inline]
pub fn record_relay_finished(kind: &'static str, duration_secs: f64) {
    gauge!(RELAYS_ACTIVE, "kind" => kind).decrement(1.0);
    histogram!(RELAY_DURATION_SECONDS, "kind" => kind).record(duration_secs);
}

/// Record bytes copied towards the sink.
#[inline]
pub fn record_bytes_inbound(bytes: u64) {
    counter!(BYTES_INBOUND_TOTAL).increment(bytes);
}

/// Record bytes copied back towards the source.
#[inline]
pub fn record_bytes_outbound(bytes: u64) {
    counter!(BYTES_OUTBOUND_TOTAL).increment(bytes);
}

/// Record a relayed datagram (direction: "inbound" or "outbound").
#[inline]
pub fn record_packet(direction: &'static str, bytes: usize) {
    counter!(PACKETS_TOTAL, "direction" => direction).increment(1);
    match direction {
        "inbound" => record_bytes_inbound(bytes as u64),
        _ => record_bytes_outbound(bytes as u64),
    }
}

/// Record a failed sink dial.
#[inline]
pub fn record_dial_failure(kind: &'static str) {
    counter!(DIAL_FAILURES_TOTAL, "kind" => kind).increment(1);
}

/// Record a transient accept error.
#[inline]
pub fn record_accept_error(kind: &'static str) {
    counter!(ACCEPT_ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Record an adapter classification (protocol: "socks" or "http").
#[inline]
pub fn record_adapter_classified(protocol: &'static str) {
    counter!(ADAPTER_CLASSIFIED_TOTAL, "protocol" => protocol).increment(1);
}

/// Record a new UDP session.
#[inline]
pub fn record_udp_session_created() {
    counter!(UDP_SESSIONS_TOTAL).increment(1);
    gauge!(UDP_SESSIONS_ACTIVE).increment(1.0);
}

/// Record a UDP session leaving the table.
#[inline]
pub fn record_udp_session_closed(expired: bool) {
    gauge!(UDP_SESSIONS_ACTIVE).decrement(1.0);
    if expired {
        counter!(UDP_SESSIONS_EXPIRED_TOTAL).increment(1);
    }
}

/// Record a dropped datagram (reason: "queue_full", "invalid_metadata", ...).
#[inline]
pub fn record_datagram_dropped(reason: &'static str) {
    counter!(DATAGRAMS_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Record a redirection outcome ("queued", "completed", "failed", "dropped").
#[inline]
pub fn record_redirect(outcome: &'static str) {
    counter!(REDIRECTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an error by type.
#[inline]
pub fn record_error(error_type: &'static str) {
    counter!(ERRORS_TOTAL, "type" => error_type).increment(1);
}

// ============================================================================
// Error Type Constants (re-exported from tunnel-core)
// ============================================================================

pub use tunnel_core::{
    ERROR_AUTH, ERROR_CLOSED, ERROR_CONFIG, ERROR_DIAL, ERROR_IO, ERROR_PROTOCOL, ERROR_RESOLVE,
    ERROR_TIMEOUT, ERROR_UNSUPPORTED,
};
