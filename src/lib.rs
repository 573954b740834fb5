//! # tunnel-rs
//!
//! A composable tunneling proxy.
//!
//! Tunnel layers implement one small contract (dial and accept streams and
//! datagram endpoints, each carrying its target) and are stacked by
//! composition. A relay engine splices everything its source layers accept
//! to connections dialed on a sink layer.
//!
//! ## Crates
//!
//! - [`tunnel_core`] - Default constants and shared I/O primitives
//! - [`tunnel`] - Tunnel contract, freedom, adapter and tproxy layers
//! - [`tunnel_auth`] - User authentication and traffic accounting
//! - [`tunnel_config`] - Configuration loading and validation
//! - [`tunnel_metrics`] - Prometheus-compatible metrics
//! - [`tunnel_redirector`] - Fallback redirection worker pool
//! - [`tunnel_proxy`] - Relay engine, run-type registry and CLI

pub use tunnel as layers;
pub use tunnel_auth as auth;
pub use tunnel_config as config;
pub use tunnel_core as core;
pub use tunnel_metrics as metrics;
pub use tunnel_proxy as proxy;
pub use tunnel_redirector as redirector;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use tunnel::{Address, Client, Conn, Metadata, Network, PacketConn, Server, TunnelError};
    pub use tunnel_auth::{Authenticator, MemoryAuthenticator};
    pub use tunnel_config::{Config, load_config, validate_config};
    pub use tunnel_proxy::{
        AssemblyContext, CancellationToken, Proxy, ProxyError, Registry, build_proxy,
    };
}
