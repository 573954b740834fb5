//! CLI override definitions and application logic.

use clap::Parser;

use crate::Config;

#[derive(Debug, Clone, Parser, Default)]
pub struct CliOverrides {
    /// Override run type, e.g. nat
    #[arg(long)]
    pub run_type: Option<String>,
    /// Override local listen host
    #[arg(long)]
    pub local_addr: Option<String>,
    /// Override local listen port
    #[arg(long)]
    pub local_port: Option<u16>,
    /// Override remote host
    #[arg(long)]
    pub remote_addr: Option<String>,
    /// Override remote port
    #[arg(long)]
    pub remote_port: Option<u16>,
    /// Override password list (repeatable or comma-separated)
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub password: Option<Vec<String>>,
    /// Override UDP session idle timeout (seconds)
    #[arg(long)]
    pub udp_timeout: Option<u64>,
    /// Override stream idle timeout (seconds, 0 = none)
    #[arg(long)]
    pub tcp_idle_timeout: Option<u64>,
    /// Buffer size for stream relay (bytes)
    #[arg(long)]
    pub relay_buffer_size: Option<usize>,
    /// Override metrics listen address
    #[arg(long)]
    pub metrics_listen: Option<String>,
    /// Override log level (trace/debug/info/warn/error)
    #[arg(long)]
    pub log_level: Option<String>,
    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<String>,
}

pub fn apply_overrides(config: &mut Config, overrides: &CliOverrides) {
    if let Some(v) = &overrides.run_type {
        config.run_type = v.clone();
    }
    if let Some(v) = &overrides.local_addr {
        config.local_addr = v.clone();
    }
    if let Some(v) = overrides.local_port {
        config.local_port = v;
    }
    if let Some(v) = &overrides.remote_addr {
        config.remote_addr = v.clone();
    }
    if let Some(v) = overrides.remote_port {
        config.remote_port = v;
    }
    if let Some(v) = &overrides.password {
        config.password = v.clone();
    }
    if let Some(v) = overrides.udp_timeout {
        config.udp_timeout = v;
    }
    if let Some(v) = overrides.tcp_idle_timeout {
        config.relay.tcp_idle_timeout = v;
    }
    if let Some(v) = overrides.relay_buffer_size {
        config.relay.buffer_size = v;
    }
    if let Some(v) = &overrides.metrics_listen {
        config.metrics.listen = Some(v.clone());
    }
    if let Some(v) = &overrides.log_level {
        config.logging.level = Some(v.clone());
    }
    if let Some(v) = &overrides.log_file {
        config.logging.file = Some(v.clone());
    }
}
