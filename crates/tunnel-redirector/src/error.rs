//! Redirector error types.

use tunnel_core::ERROR_CLOSED;

use crate::redirector::Redirection;

/// Errors returned by [`Redirector::redirect`](crate::Redirector::redirect).
#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    /// The redirector shut down before accepting the request. The request
    /// is handed back so the caller can close its connection.
    #[error("redirector closed")]
    Closed(Redirection),
}

impl RedirectError {
    /// Recover the rejected request.
    pub fn into_inner(self) -> Redirection {
        match self {
            RedirectError::Closed(redirection) => redirection,
        }
    }

    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            RedirectError::Closed(_) => ERROR_CLOSED,
        }
    }
}
