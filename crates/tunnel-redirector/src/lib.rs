//! Fallback redirection for tunnel-rs.
//!
//! A server layer that cannot validate a connection hands it to the
//! [`Redirector`] instead of closing it. The connection is then relayed to
//! a fallback address, so the client sees whatever that address would
//! answer.

mod error;
mod redirector;

pub use error::RedirectError;
pub use redirector::{DialFn, DialFuture, Redirection, Redirector, RedirectorConfig, default_dial};
