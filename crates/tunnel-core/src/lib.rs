//! Core types and constants shared across tunnel crates.
//!
//! This crate provides:
//! - Default configuration values
//! - Error type constants for metrics/logging
//! - Shared I/O primitives (relay, rewindable stream)

pub mod defaults;
pub mod errors;
pub mod io;

pub use defaults::*;
pub use errors::*;

/// Project name.
pub const PROJECT_NAME: &str = "tunnel-rs";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
