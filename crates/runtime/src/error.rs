use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::registry::RegistryError;
use crate::schema::ValidationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Bridge(#[from] bridge::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating or running a capability.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    Validation(#[from] ValidationError),

    #[error("timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("failed to instantiate: {0}")]
    Instantiation(String),
}

impl CapabilityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CapabilityError::NotFound(_) => ErrorKind::NotFound,
            CapabilityError::Validation(_) => ErrorKind::Validation,
            CapabilityError::Timeout(_) | CapabilityError::Cancelled => ErrorKind::Timeout,
            CapabilityError::Transport(_) => ErrorKind::Transport,
            CapabilityError::Execution(_) | CapabilityError::Instantiation(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Failure category reported in an [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Timeout,
    Transport,
    Internal,
}
