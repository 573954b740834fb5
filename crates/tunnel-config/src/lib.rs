//! Configuration loading and CLI definitions.
//!
//! The top-level keys are flat (`run_type`, `local_addr`, `local_port`,
//! ...); tuning knobs live in optional sections that default to the
//! constants in `tunnel_core::defaults`.

mod cli;
mod defaults;
mod loader;
mod types;
mod validate;

pub use cli::{CliOverrides, apply_overrides};
pub use loader::{
    ConfigError, ConfigFormat, DEFAULT_CONFIG_PATHS, load_config, load_config_reader,
    load_config_str, load_default_config,
};
pub use types::*;
pub use validate::validate_config;
