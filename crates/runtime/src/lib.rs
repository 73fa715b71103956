//! Toolhost runtime: capabilities, their registry, and their execution.
//!
//! # Overview
//!
//! - **Capability**: a named operation with a parameter schema, implemented
//!   in-process ([`builtin`]) or forwarded to a remote server
//!   ([`RemoteCapability`]).
//! - **Registry**: maps names to factories that build capability instances.
//! - **Discovery**: connects to remote servers and registers their
//!   capabilities as `<server>__<capability>`.
//! - **ExecutionManager**: validates arguments and runs calls on a bounded
//!   pool under a deadline, always answering with an [`ExecutionResult`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use runtime::{ExecutionConfig, ExecutionManager, Registry, builtin};
//! use serde_json::json;
//!
//! # async fn example() {
//! let registry = Arc::new(Registry::new());
//! builtin::register_all(&registry);
//!
//! let manager = ExecutionManager::new(registry, ExecutionConfig::default());
//! let result = manager
//!     .execute("calculator", json!({"operation": "add", "a": 1, "b": 2}))
//!     .await;
//! assert!(result.success);
//! # }
//! ```

pub mod builtin;
mod capability;
mod config;
mod error;
mod host;
mod manager;
mod registry;
pub mod remote;
mod schema;

pub use capability::{
    Capability, Declaration, Descriptor, Factory, FunctionDeclaration, Origin, factory, shared,
};
pub use config::{ExecutionConfig, ToolsConfig};
pub use error::{CapabilityError, Error, ErrorKind, Result};
pub use host::ToolHost;
pub use manager::{
    ExecutionManager, ExecutionResult, HealthReport, HealthStatus, ToolCall, ToolOutcome,
};
pub use registry::{Registry, RegistryError, validate_name};
pub use remote::{Connection, Discovery, RemoteCapability};
pub use schema::{ParamSpec, ParamType, ParameterSchema, ValidationError};
