//! Proxy error types.

use tunnel::TunnelError;
use tunnel_auth::AuthError;
use tunnel_config::ConfigError;
use tunnel_core::{ERROR_CONFIG, ERROR_IO, ERROR_UNSUPPORTED};

/// Proxy error type.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tunnel: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
    #[error("unknown run type: {0}")]
    UnknownRunType(String),
    #[error("invalid listen address: {0}")]
    InvalidListen(String),
}

impl ProxyError {
    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Io(_) => ERROR_IO,
            ProxyError::Tunnel(e) => e.error_type(),
            ProxyError::Config(_) | ProxyError::InvalidListen(_) => ERROR_CONFIG,
            ProxyError::Auth(e) => e.error_type(),
            ProxyError::UnknownRunType(_) => ERROR_UNSUPPORTED,
        }
    }
}
