//! Static configuration for the runtime.

use std::time::Duration;

use bridge::ServerConfig;
use serde::{Deserialize, Deserializer};

use crate::builtin;

/// Limits applied by the execution manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Calls allowed to run at once; the rest queue.
    pub max_concurrent: usize,

    /// Deadline for one call, queueing included.
    #[serde(rename = "timeout_ms", deserialize_with = "duration_ms")]
    pub timeout: Duration,

    /// How long a timed-out capability may keep running to observe its
    /// cancellation before its future is dropped.
    #[serde(rename = "cancel_grace_ms", deserialize_with = "duration_ms")]
    pub cancel_grace: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_millis(250),
        }
    }
}

impl ExecutionConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, cancel_grace: Duration) -> Self {
        self.cancel_grace = cancel_grace;
        self
    }
}

fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Which capabilities to load and how to run them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Builtin capabilities to register, by name.
    pub builtins: Vec<String>,

    /// Remote servers to discover, as `[[server]]` tables.
    #[serde(rename = "server")]
    pub servers: Vec<ServerConfig>,

    pub execution: ExecutionConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            builtins: builtin::names().map(str::to_string).collect(),
            servers: Vec::new(),
            execution: ExecutionConfig::default(),
        }
    }
}
