//! Configuration loading from toolhost.toml.

use std::path::Path;

use runtime::ToolsConfig;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    /// Builtins, servers and execution limits.
    #[serde(flatten)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),
}
