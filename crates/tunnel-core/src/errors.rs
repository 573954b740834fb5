//! Error type constants for metrics and logging.
//!
//! These constants provide consistent error classification across all crates.

/// I/O error.
pub const ERROR_IO: &str = "io";
/// Component was closed or shut down.
pub const ERROR_CLOSED: &str = "closed";
/// DNS/address resolution error.
pub const ERROR_RESOLVE: &str = "resolve";
/// Outbound dial failure.
pub const ERROR_DIAL: &str = "dial";
/// Protocol detection/validation error.
pub const ERROR_PROTOCOL: &str = "protocol";
/// Timeout error.
pub const ERROR_TIMEOUT: &str = "timeout";
/// Authentication error.
pub const ERROR_AUTH: &str = "auth";
/// Configuration error.
pub const ERROR_CONFIG: &str = "config";
/// Operation not supported by a layer.
pub const ERROR_UNSUPPORTED: &str = "unsupported";
