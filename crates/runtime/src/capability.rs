//! The capability contract shared by builtin and remote implementations.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::CapabilityError;
use crate::schema::{ParameterSchema, ValidationError};

/// Where a capability comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Builtin,
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Builtin => f.write_str("builtin"),
            Origin::Remote => f.write_str("remote"),
        }
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "builtin" => Ok(Origin::Builtin),
            "remote" => Ok(Origin::Remote),
            other => Err(format!("unknown origin: {other}")),
        }
    }
}

/// Metadata describing one capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: ParameterSchema,
    pub origin: Origin,
}

impl Descriptor {
    pub fn to_declaration(&self) -> Declaration {
        Declaration {
            kind: "function".to_string(),
            function: FunctionDeclaration {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameter_schema.to_json_schema(),
            },
        }
    }
}

/// Function-calling declaration handed to a language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDeclaration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A named, schema-described operation that can be invoked with JSON
/// arguments.
///
/// Callers never need to know whether an implementation runs in-process or
/// forwards to a remote server.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameter_schema(&self) -> &ParameterSchema;

    fn origin(&self) -> Origin {
        Origin::Builtin
    }

    /// Check arguments before execution.
    fn validate(&self, arguments: &Value) -> Result<(), ValidationError> {
        self.parameter_schema().validate(arguments)
    }

    /// Run the capability.
    ///
    /// `cancel` fires when the caller stops waiting; long-running bodies
    /// should watch it and return [`CapabilityError::Cancelled`].
    async fn execute(
        &self,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Value, CapabilityError>;

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameter_schema: self.parameter_schema().clone(),
            origin: self.origin(),
        }
    }

    fn to_declaration(&self) -> Declaration {
        self.descriptor().to_declaration()
    }
}

/// Zero-argument constructor stored in the registry.
pub type Factory =
    Arc<dyn Fn() -> Result<Arc<dyn Capability>, CapabilityError> + Send + Sync>;

/// Wrap a constructor that builds a fresh instance per call.
pub fn factory<C, F>(make: F) -> Factory
where
    C: Capability + 'static,
    F: Fn() -> Result<C, CapabilityError> + Send + Sync + 'static,
{
    Arc::new(move || make().map(|c| Arc::new(c) as Arc<dyn Capability>))
}

/// Factory that hands out the same instance every time.
pub fn shared(capability: Arc<dyn Capability>) -> Factory {
    Arc::new(move || Ok(Arc::clone(&capability)))
}

/// Run a factory; a panic inside it becomes an instantiation failure.
pub(crate) fn build(factory: &Factory) -> Result<Arc<dyn Capability>, CapabilityError> {
    catch_unwind(AssertUnwindSafe(|| factory())).unwrap_or_else(|panic| {
        Err(CapabilityError::Instantiation(format!(
            "factory panicked: {}",
            panic_message(&*panic)
        )))
    })
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
