//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Timeout Defaults
// ============================================================================

/// Default UDP session idle timeout in seconds.
pub const DEFAULT_UDP_TIMEOUT_SECS: u64 = 60;
/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
/// Default stream idle timeout in seconds (0 = disabled).
pub const DEFAULT_TCP_IDLE_TIMEOUT_SECS: u64 = 0;
/// Default protocol probe timeout in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// Buffer/Size Defaults
// ============================================================================

/// Maximum datagram size relayed by packet loops (8 KiB).
pub const MAX_PACKET_SIZE: usize = 8 * 1024;
/// Default relay buffer size (32 KiB).
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 32768;
/// Minimum accepted relay buffer size.
pub const MIN_RELAY_BUFFER_SIZE: usize = 1024;
/// Maximum accepted relay buffer size.
pub const MAX_RELAY_BUFFER_SIZE: usize = 1024 * 1024;
/// Default TCP listener backlog.
pub const DEFAULT_CONNECTION_BACKLOG: u32 = 1024;

// ============================================================================
// Adapter Defaults
// ============================================================================

/// Bytes peeked from a new connection to classify its protocol.
pub const PROBE_SIZE: usize = 3;
/// Rewind buffer size used while probing.
pub const PROBE_BUFFER_SIZE: usize = 16;
/// Capacity of each per-protocol delivery queue.
pub const DEFAULT_ADAPTER_QUEUE: usize = 32;
/// Connections probed concurrently before the adapter stops accepting.
pub const DEFAULT_ADAPTER_MAX_PROBES: usize = 256;
/// First byte of a SOCKS5 handshake.
pub const SOCKS5_VERSION: u8 = 0x05;

// ============================================================================
// Tproxy Defaults
// ============================================================================

/// Capacity of the raw datagram intake queue.
pub const DEFAULT_TPROXY_INTAKE_QUEUE: usize = 1024;
/// Capacity of each session's input/output queue.
pub const DEFAULT_SESSION_QUEUE: usize = 128;
/// Capacity of the new-session announcement queue.
pub const DEFAULT_SESSION_ANNOUNCE_QUEUE: usize = 32;

// ============================================================================
// Redirector Defaults
// ============================================================================

/// Default redirection queue capacity.
pub const DEFAULT_REDIRECTOR_QUEUE: usize = 64;
/// Default number of redirector workers.
pub const DEFAULT_REDIRECTOR_WORKERS: usize = 1;

// ============================================================================
// Statistic Defaults
// ============================================================================

/// Default interval between store reconciliations in seconds.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
