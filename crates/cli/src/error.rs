//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration file could not be read or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An error occurred while serving the demo server.
    #[error(transparent)]
    Bridge(#[from] bridge::Error),

    /// The `--args` value is not valid JSON.
    #[error("arguments are not valid JSON: {0}")]
    InvalidArguments(#[source] serde_json::Error),

    /// The capability ran but reported a failure.
    #[error("call failed: {0}")]
    CallFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
