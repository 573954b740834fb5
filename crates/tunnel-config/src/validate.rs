//! Configuration validation logic.

use crate::Config;
use crate::defaults::{max_relay_buffer_size, min_relay_buffer_size};
use crate::loader::ConfigError;

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.run_type.trim().is_empty() {
        return Err(ConfigError::Validation("run_type is empty".into()));
    }
    if config.local_addr.trim().is_empty() {
        return Err(ConfigError::Validation("local_addr is empty".into()));
    }
    if config.local_port == 0 {
        return Err(ConfigError::Validation("local_port must be > 0".into()));
    }
    if config.udp_timeout == 0 {
        return Err(ConfigError::Validation("udp_timeout must be > 0".into()));
    }
    let (min, max) = (min_relay_buffer_size(), max_relay_buffer_size());
    if !(min..=max).contains(&config.relay.buffer_size) {
        return Err(ConfigError::Validation(format!(
            "relay.buffer_size must be {min}..={max}"
        )));
    }
    if config.redirector.workers == 0 {
        return Err(ConfigError::Validation(
            "redirector.workers must be > 0".into(),
        ));
    }
    if config.redirector.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "redirector.queue_capacity must be > 0".into(),
        ));
    }
    if config.adapter.probe_timeout == 0 {
        return Err(ConfigError::Validation(
            "adapter.probe_timeout must be > 0".into(),
        ));
    }
    if config.adapter.queue_capacity == 0 || config.adapter.session_queue == 0 {
        return Err(ConfigError::Validation(
            "adapter queue capacities must be > 0".into(),
        ));
    }
    if let Some(format) = &config.logging.format
        && !matches!(format.as_str(), "json" | "pretty" | "compact")
    {
        return Err(ConfigError::Validation(
            "logging.format must be one of: json, pretty, compact".into(),
        ));
    }
    if let Some(output) = &config.logging.output
        && !matches!(output.as_str(), "stdout" | "stderr")
    {
        return Err(ConfigError::Validation(
            "logging.output must be stdout or stderr".into(),
        ));
    }
    Ok(())
}
