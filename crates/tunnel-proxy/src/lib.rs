//! Relay engine for tunnel-rs.
//!
//! A [`Proxy`] accepts streams and datagram endpoints from any number of
//! source [`Server`](tunnel::Server)s and splices each one to a connection
//! dialed on a single sink [`Client`](tunnel::Client). Which sources and
//! sink a process runs is decided by the [`Registry`] from the configured
//! run type.

pub mod cli;
pub mod error;
pub mod proxy;
pub mod registry;
mod relay;
pub mod util;

pub use cli::ProxyArgs;
pub use error::ProxyError;
pub use proxy::{Proxy, RelayConfig};
pub use registry::{
    AssembleFuture, Assembler, AssemblyContext, Registry, adapter_config, build_proxy, local_listen,
};
pub use tokio_util::sync::CancellationToken;
