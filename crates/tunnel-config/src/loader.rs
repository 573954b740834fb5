//! Configuration file loading and error types.

use std::io::Read;
use std::{fs, path::Path};

use tracing::warn;

use crate::Config;

/// Files tried, in order, when no path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 4] =
    ["config.json", "config.yml", "config.yaml", "config.toml"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config format")]
    UnsupportedFormat,
    #[error("no usable config file found")]
    NotFound,
    #[error("validation: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        tunnel_core::ERROR_CONFIG
    }
}

/// Serialization format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|s| s.to_str()).unwrap_or("") {
            "json" | "jsonc" => Some(ConfigFormat::Json),
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "toml" => Some(ConfigFormat::Toml),
            _ => None,
        }
    }
}

/// Parse a configuration document. JSON may carry comments.
pub fn load_config_str(data: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Json => {
            let stripped = json_comments::StripComments::new(data.as_bytes());
            Ok(serde_json::from_reader(stripped)?)
        }
        ConfigFormat::Yaml => Ok(serde_yaml::from_str(data)?),
        ConfigFormat::Toml => Ok(toml::from_str(data)?),
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path).ok_or(ConfigError::UnsupportedFormat)?;
    let data = fs::read_to_string(path)?;
    load_config_str(&data, format)
}

/// Read a configuration document from a reader such as standard input.
pub fn load_config_reader(
    mut reader: impl Read,
    format: ConfigFormat,
) -> Result<Config, ConfigError> {
    let mut data = String::new();
    reader.read_to_string(&mut data)?;
    load_config_str(&data, format)
}

/// Try [`DEFAULT_CONFIG_PATHS`] inside `dir` and return the first that loads.
pub fn load_default_config(dir: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let dir = dir.as_ref();
    for name in DEFAULT_CONFIG_PATHS {
        let path = dir.join(name);
        match load_config(&path) {
            Ok(config) => return Ok(config),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to load config"),
        }
    }
    Err(ConfigError::NotFound)
}
