//! Named assemblers that build a [`Proxy`] for a run type.
//!
//! The registry is an explicit value built once at startup and handed to
//! [`build_proxy`]; tests and embedders register their own assemblers next
//! to the built-in ones.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tunnel::adapter::AdapterConfig;
#[cfg(target_os = "linux")]
use tunnel::tproxy::TproxyConfig;
use tunnel_auth::Authenticator;
use tunnel_config::Config;
use tunnel_redirector::Redirector;

use crate::error::ProxyError;
use crate::proxy::Proxy;

/// Everything an assembler may hand to the layers it constructs.
#[derive(Clone)]
pub struct AssemblyContext {
    pub config: Arc<Config>,
    /// Parent scope; layers and the proxy take child tokens of it.
    pub shutdown: CancellationToken,
    pub authenticator: Arc<dyn Authenticator>,
    pub redirector: Redirector,
}

pub type AssembleFuture = Pin<Box<dyn Future<Output = Result<Proxy, ProxyError>> + Send>>;

/// Builds the source servers and sink client of one run type.
pub type Assembler = Arc<dyn Fn(AssemblyContext) -> AssembleFuture + Send + Sync>;

/// Run-type name to assembler map. Names are case-insensitive.
#[derive(Default, Clone)]
pub struct Registry {
    assemblers: HashMap<String, Assembler>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in run types.
    ///
    /// - `NAT` (Linux): transparent proxy in, direct dial out.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(target_os = "linux")]
        registry.register(
            "nat",
            Arc::new(|ctx: AssemblyContext| -> AssembleFuture { Box::pin(nat::assemble(ctx)) }),
        );
        registry
    }

    /// Register `assembler` under `run_type`, returning the one it replaces.
    pub fn register(&mut self, run_type: &str, assembler: Assembler) -> Option<Assembler> {
        self.assemblers.insert(run_type.to_uppercase(), assembler)
    }

    pub fn contains(&self, run_type: &str) -> bool {
        self.assemblers.contains_key(&run_type.to_uppercase())
    }

    /// Registered run types, sorted.
    pub fn run_types(&self) -> Vec<String> {
        let mut names: Vec<_> = self.assemblers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Assemble the proxy registered under `run_type`.
    pub async fn build(&self, run_type: &str, ctx: AssemblyContext) -> Result<Proxy, ProxyError> {
        let name = run_type.to_uppercase();
        let assembler = self
            .assemblers
            .get(&name)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownRunType(run_type.to_string()))?;
        info!(run_type = %name, "assembling proxy");
        assembler(ctx).await
    }
}

/// Assemble the proxy for the run type named in `ctx.config`.
pub async fn build_proxy(registry: &Registry, ctx: AssemblyContext) -> Result<Proxy, ProxyError> {
    let run_type = ctx.config.run_type.clone();
    registry.build(&run_type, ctx).await
}

/// Listen address of the local side, `local_addr:local_port`.
pub fn local_listen(config: &Config) -> Result<SocketAddr, ProxyError> {
    let endpoint = config.local_endpoint();
    endpoint
        .parse()
        .map_err(|_| ProxyError::InvalidListen(endpoint))
}

/// Adapter settings for overlays sharing the local listener.
pub fn adapter_config(config: &Config) -> Result<AdapterConfig, ProxyError> {
    let mut adapter = AdapterConfig::new(local_listen(config)?);
    adapter.probe_timeout = Duration::from_secs(config.adapter.probe_timeout);
    adapter.queue_capacity = config.adapter.queue_capacity;
    Ok(adapter)
}

/// Transparent proxy settings for the local listener.
#[cfg(target_os = "linux")]
pub fn tproxy_config(config: &Config) -> Result<TproxyConfig, ProxyError> {
    let mut tproxy = TproxyConfig::new(local_listen(config)?);
    tproxy.udp_timeout = Duration::from_secs(config.udp_timeout);
    tproxy.session_queue = config.adapter.session_queue;
    Ok(tproxy)
}

#[cfg(target_os = "linux")]
mod nat {
    use std::sync::Arc;

    use tunnel::freedom::FreedomClient;
    use tunnel::tproxy::TproxyServer;

    use super::{AssemblyContext, tproxy_config};
    use crate::error::ProxyError;
    use crate::proxy::{Proxy, RelayConfig};

    /// Transparent router: redirected traffic is dialed out directly.
    pub(super) async fn assemble(ctx: AssemblyContext) -> Result<Proxy, ProxyError> {
        let source = TproxyServer::bind(&tproxy_config(&ctx.config)?, &ctx.shutdown)?;
        let sink = FreedomClient::new(&ctx.shutdown);
        Ok(Proxy::new(
            vec![Arc::new(source)],
            Arc::new(sink),
            RelayConfig::from_config(&ctx.config),
            &ctx.shutdown,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_case_insensitive() {
        let mut registry = Registry::new();
        let assembler: Assembler = Arc::new(|_ctx: AssemblyContext| -> AssembleFuture {
            Box::pin(async { Err(ProxyError::UnknownRunType("stub".into())) })
        });
        assert!(registry.register("Custom", assembler.clone()).is_none());
        assert!(registry.contains("CUSTOM"));
        assert!(registry.contains("custom"));
        assert!(registry.register("custom", assembler).is_some());
        assert_eq!(registry.run_types(), vec!["CUSTOM".to_string()]);
    }

    fn config(json: &str) -> Config {
        tunnel_config::load_config_str(json, tunnel_config::ConfigFormat::Json).unwrap()
    }

    #[test]
    fn test_adapter_config_from_settings() {
        let config = config(
            r#"{"run_type": "nat", "local_addr": "::1", "local_port": 1080,
                "adapter": {"probe_timeout": 2, "queue_capacity": 8}}"#,
        );
        let adapter = adapter_config(&config).unwrap();
        assert_eq!(adapter.listen, "[::1]:1080".parse::<SocketAddr>().unwrap());
        assert_eq!(adapter.probe_timeout, Duration::from_secs(2));
        assert_eq!(adapter.queue_capacity, 8);
    }

    #[test]
    fn test_local_listen_rejects_hostnames() {
        let config =
            config(r#"{"run_type": "nat", "local_addr": "localhost", "local_port": 1080}"#);
        assert!(matches!(
            local_listen(&config),
            Err(ProxyError::InvalidListen(endpoint)) if endpoint == "localhost:1080"
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_tproxy_config_from_settings() {
        let config = config(
            r#"{"run_type": "nat", "local_addr": "0.0.0.0", "local_port": 12345,
                "udp_timeout": 30, "adapter": {"session_queue": 4}}"#,
        );
        let tproxy = tproxy_config(&config).unwrap();
        assert_eq!(tproxy.listen, "0.0.0.0:12345".parse::<SocketAddr>().unwrap());
        assert_eq!(tproxy.udp_timeout, Duration::from_secs(30));
        assert_eq!(tproxy.session_queue, 4);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_defaults_include_nat() {
        assert!(Registry::with_defaults().contains("nat"));
    }
}
