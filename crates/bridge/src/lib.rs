//! Client and server plumbing for remote capability servers.
//!
//! A capability server is an independent process that speaks JSON-RPC 2.0
//! over its stdin/stdout, one JSON object per line. The client side spawns
//! (or attaches to) a server, performs the `initialize` handshake, lists the
//! server's capabilities and calls them.
//!
//! # Example
//!
//! ```no_run
//! use bridge::{Client, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> bridge::Result<()> {
//! let config = ServerConfig::new("files", "files-server").with_args(["--root", "./workspace"]);
//!
//! let client = Client::spawn(config).await?;
//! client.initialize().await?;
//!
//! for capability in client.list_capabilities().await? {
//!     println!("Capability: {}", capability.name);
//! }
//!
//! let result = client
//!     .call_capability(
//!         "read_file",
//!         serde_json::json!({ "path": "./README.md" }),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{}", result.joined_text());
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod protocol;
mod server;

pub use client::{Client, ConnectionState, DEFAULT_TIMEOUT, MAX_OUTPUT_SIZE, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{
    CallCapabilityParams, CallCapabilityResult, CapabilityInfo, Content, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListCapabilitiesResult,
    PROTOCOL_VERSION, RequestId, ServerInfo,
};
pub use server::{Handler, serve};
