//! Configuration types.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::defaults::*;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which assembler builds the proxy, e.g. `nat`.
    pub run_type: String,
    #[serde(default)]
    pub local_addr: String,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub remote_port: u16,
    /// Plaintext passwords of the users allowed in.
    #[serde(default)]
    pub password: Vec<String>,
    /// UDP session idle timeout (seconds).
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout: u64,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub redirector: RedirectorSettings,
    #[serde(default)]
    pub adapter: AdapterSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// `local_addr:local_port`, bracketing IPv6 literals.
    pub fn local_endpoint(&self) -> String {
        join_host_port(&self.local_addr, self.local_port)
    }

    /// `remote_addr:remote_port`, bracketing IPv6 literals.
    pub fn remote_endpoint(&self) -> String {
        join_host_port(&self.remote_addr, self.remote_port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

/// Relay engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Per-direction copy buffer (bytes).
    #[serde(default = "default_relay_buffer_size")]
    pub buffer_size: usize,
    /// Stream idle timeout (seconds, 0 = none).
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_timeout: u64,
    /// Grace period for in-flight relays on shutdown (seconds).
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_size: default_relay_buffer_size(),
            tcp_idle_timeout: default_tcp_idle_timeout_secs(),
            shutdown_timeout: default_shutdown_timeout_secs(),
        }
    }
}

/// Fallback redirector pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectorSettings {
    #[serde(default = "default_redirector_workers")]
    pub workers: usize,
    #[serde(default = "default_redirector_queue")]
    pub queue_capacity: usize,
}

impl Default for RedirectorSettings {
    fn default() -> Self {
        Self {
            workers: default_redirector_workers(),
            queue_capacity: default_redirector_queue(),
        }
    }
}

/// Protocol-sniffing adapter and UDP session queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    /// Time allowed for a client to send its first bytes (seconds).
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout: u64,
    #[serde(default = "default_adapter_queue")]
    pub queue_capacity: usize,
    /// Per-session datagram queue length.
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout_secs(),
            queue_capacity: default_adapter_queue(),
            session_queue: default_session_queue(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: Option<String>,
    /// Log format: json, pretty, or compact. Default: pretty.
    pub format: Option<String>,
    /// Output target: stdout or stderr. Default: stderr.
    pub output: Option<String>,
    /// Also append logs to this file.
    pub file: Option<String>,
    /// Per-module log level filters (e.g., {"tunnel::tproxy": "debug"}).
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus listen address, disabled when unset.
    pub listen: Option<String>,
}
