//! Authentication error types.

use tunnel_core::ERROR_AUTH;

/// Authentication error.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Invalid credentials provided.
    #[error("invalid credential")]
    Invalid,

    /// Backend error (database, network, etc.).
    #[error("backend error: {0}")]
    Backend(String),

    /// User not found.
    #[error("user not found")]
    NotFound,
}

impl AuthError {
    /// Create a backend error from any error type.
    #[inline]
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }

    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        ERROR_AUTH
    }
}
