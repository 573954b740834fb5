//! Composable tunnel layers for tunnel-rs.
//!
//! Every layer implements the same small contract: a [`Client`] dials
//! outbound [`Conn`]s and [`PacketConn`]s, a [`Server`] accepts them. Each
//! stream carries the [`Metadata`] of its target, each datagram carries its
//! own. Layers wrap exactly one underlying layer, so a stack is assembled by
//! composition.
//!
//! # Layers
//!
//! - [`freedom`]: direct outbound dialing, the innermost client.
//! - [`adapter`]: one listener shared by SOCKS5 and HTTP clients.
//! - [`tproxy`]: transparent proxy server (Linux only).

pub mod adapter;
pub mod address;
pub mod conn;
pub mod error;
pub mod freedom;
#[cfg(target_os = "linux")]
pub mod tproxy;
pub mod traits;

pub use address::{Address, AddressType, Host, Metadata, Network};
pub use conn::MetadataConn;
pub use error::TunnelError;
pub use traits::{BoxConn, BoxPacketConn, Client, Conn, Overlay, PacketConn, Server};
