//! Error types for tunnel layers.

use std::io;

use tunnel_core::{
    ERROR_CLOSED, ERROR_DIAL, ERROR_IO, ERROR_PROTOCOL, ERROR_RESOLVE, ERROR_UNSUPPORTED,
};

use crate::traits::Overlay;

/// Errors returned by tunnel layers.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// The component was closed; callers must not retry.
    #[error("{0} closed")]
    Closed(&'static str),
    #[error("{layer} does not support {operation}")]
    Unsupported {
        layer: &'static str,
        operation: &'static str,
    },
    #[error("unsupported overlay: {0:?}")]
    UnsupportedOverlay(Option<Overlay>),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("resolve {0} failed")]
    Resolve(String),
    #[error("dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("original destination: {0}")]
    OriginalDestination(io::Error),
    /// The listening socket failed and cannot accept any more connections.
    #[error("listener failed: {0}")]
    Listener(io::Error),
}

impl TunnelError {
    /// Whether this error means the component has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, TunnelError::Closed(_))
    }

    /// Whether the component can never recover from this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::Listener(_))
    }

    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            TunnelError::Io(_) | TunnelError::Listener(_) => ERROR_IO,
            TunnelError::Closed(_) => ERROR_CLOSED,
            TunnelError::Unsupported { .. } | TunnelError::UnsupportedOverlay(_) => {
                ERROR_UNSUPPORTED
            }
            TunnelError::InvalidAddress(_) | TunnelError::OriginalDestination(_) => ERROR_PROTOCOL,
            TunnelError::Resolve(_) => ERROR_RESOLVE,
            TunnelError::Dial { .. } => ERROR_DIAL,
        }
    }
}
