//! Bridge error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server not initialized")]
    NotInitialized,

    #[error("server already initialized")]
    AlreadyInitialized,

    #[error("connection closed")]
    Closed,

    #[error("server exited unexpectedly")]
    ServerExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("call cancelled")]
    Cancelled,

    #[error("failed to (de)serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("capability call failed: {0}")]
    CapabilityFailed(String),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },

    #[error("server already connected: {0}")]
    DuplicateServer(String),
}

impl Error {
    /// Whether the error means the connection itself is unusable, as opposed
    /// to one call failing on a healthy connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Spawn { .. }
                | Error::Io(_)
                | Error::NotInitialized
                | Error::Closed
                | Error::ServerExited
                | Error::InvalidResponse(_)
                | Error::OutputTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
