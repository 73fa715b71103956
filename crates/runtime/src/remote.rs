//! Remote capabilities: server discovery and the adapter that exposes each
//! remote capability through the local contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge::protocol::{CallCapabilityResult, CapabilityInfo, Content, ServerInfo};
use bridge::{Client, DEFAULT_TIMEOUT, ServerConfig};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{Capability, Origin, shared};
use crate::error::{CapabilityError, Result};
use crate::registry::Registry;
use crate::schema::ParameterSchema;

/// Joins a server name and a capability name into a registry name.
pub const NAMESPACE_SEPARATOR: &str = "__";

pub fn namespaced(server: &str, capability: &str) -> String {
    format!("{server}{NAMESPACE_SEPARATOR}{capability}")
}

/// One live connection to a capability server.
#[async_trait]
pub trait Connection: Send + Sync {
    fn server_name(&self) -> &str;

    /// Upper bound the connection applies to one call.
    fn call_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    async fn initialize(&self) -> bridge::Result<ServerInfo>;

    async fn list_capabilities(&self) -> bridge::Result<Vec<CapabilityInfo>>;

    async fn call_capability(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> bridge::Result<CallCapabilityResult>;

    async fn close(&self) -> bridge::Result<()>;
}

#[async_trait]
impl Connection for Client {
    fn server_name(&self) -> &str {
        self.name()
    }

    fn call_timeout(&self) -> Duration {
        Client::call_timeout(self)
    }

    async fn initialize(&self) -> bridge::Result<ServerInfo> {
        Client::initialize(self).await
    }

    async fn list_capabilities(&self) -> bridge::Result<Vec<CapabilityInfo>> {
        Client::list_capabilities(self).await
    }

    async fn call_capability(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> bridge::Result<CallCapabilityResult> {
        Client::call_capability(self, name, arguments, cancel).await
    }

    async fn close(&self) -> bridge::Result<()> {
        Client::close(self).await
    }
}

/// A remote capability seen through the local [`Capability`] contract.
pub struct RemoteCapability {
    name: String,
    remote_name: String,
    description: String,
    schema: ParameterSchema,
    connection: Arc<dyn Connection>,
}

impl RemoteCapability {
    pub fn new(connection: Arc<dyn Connection>, info: CapabilityInfo) -> Self {
        let schema = info
            .input_schema
            .as_ref()
            .map(ParameterSchema::from_json_schema)
            .unwrap_or_default();

        Self {
            name: namespaced(connection.server_name(), &info.name),
            remote_name: info.name,
            description: info.description.unwrap_or_default(),
            schema,
            connection,
        }
    }

    /// Name of the capability on its server.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn server_name(&self) -> &str {
        self.connection.server_name()
    }
}

#[async_trait]
impl Capability for RemoteCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameter_schema(&self) -> &ParameterSchema {
        &self.schema
    }

    fn origin(&self) -> Origin {
        Origin::Remote
    }

    async fn execute(
        &self,
        arguments: Value,
        cancel: CancellationToken,
    ) -> std::result::Result<Value, CapabilityError> {
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        match self
            .connection
            .call_capability(&self.remote_name, arguments, &cancel)
            .await
        {
            Ok(result) => Ok(payload(result)),
            Err(e) => {
                debug!(capability = %self.name, error = %e, "remote call failed");
                Err(capability_error(e, self.connection.call_timeout()))
            }
        }
    }
}

fn capability_error(error: bridge::Error, call_timeout: Duration) -> CapabilityError {
    match error {
        bridge::Error::Timeout => CapabilityError::Timeout(call_timeout),
        bridge::Error::Cancelled => CapabilityError::Cancelled,
        bridge::Error::CapabilityFailed(message) => CapabilityError::Execution(message),
        bridge::Error::JsonRpc(e) => CapabilityError::Execution(e.to_string()),
        e @ bridge::Error::Serialize(_) => CapabilityError::Transport(e.to_string()),
        e if e.is_transport() => CapabilityError::Transport(e.to_string()),
        e => CapabilityError::Execution(e.to_string()),
    }
}

/// Flatten a call result into one JSON value.
fn payload(result: CallCapabilityResult) -> Value {
    let all_text = result
        .content
        .iter()
        .all(|c| matches!(c, Content::Text { .. }));

    match result.content.as_slice() {
        [] => Value::Null,
        [Content::Json { value }] => value.clone(),
        _ if all_text => Value::String(result.joined_text()),
        content => serde_json::to_value(content).unwrap_or(Value::Null),
    }
}

/// An attached server and the registry entries it owns.
struct Attached {
    connection: Arc<dyn Connection>,
    capabilities: Vec<String>,
}

/// Connects to capability servers and registers what they offer.
pub struct Discovery {
    registry: Arc<Registry>,
    connections: Mutex<HashMap<String, Attached>>,
}

impl Discovery {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a server and attach to it. Returns the number of capabilities
    /// registered.
    pub async fn discover(&self, config: ServerConfig) -> Result<usize> {
        let client = Client::spawn(config).await?;
        self.attach(Arc::new(client)).await
    }

    /// Discover every server, skipping those that fail.
    ///
    /// Returns the number of servers connected.
    pub async fn discover_all(&self, configs: &[ServerConfig]) -> usize {
        let mut connected = 0;
        for config in configs {
            let server = config.name.clone();
            match self.discover(config.clone()).await {
                Ok(count) => {
                    info!(%server, capabilities = count, "discovered capability server");
                    connected += 1;
                }
                Err(e) => warn!(%server, error = %e, "failed to discover capability server"),
            }
        }
        connected
    }

    /// Handshake with an open connection and register its capabilities under
    /// `<server>__<capability>`.
    ///
    /// The connection is closed if the handshake or listing fails, or if a
    /// server with the same name is already attached.
    pub async fn attach(&self, connection: Arc<dyn Connection>) -> Result<usize> {
        let server = connection.server_name().to_string();
        let mut connections = self.connections.lock().await;

        if connections.contains_key(&server) {
            close_quietly(&*connection).await;
            return Err(bridge::Error::DuplicateServer(server).into());
        }

        let catalog = match handshake(&*connection).await {
            Ok(catalog) => catalog,
            Err(e) => {
                close_quietly(&*connection).await;
                return Err(e.into());
            }
        };

        let mut capabilities = Vec::new();
        for info in catalog {
            if info.name.is_empty() {
                warn!(%server, "skipping capability without a name");
                continue;
            }

            let adapter = RemoteCapability::new(Arc::clone(&connection), info);
            let name = adapter.name().to_string();
            match self
                .registry
                .register(name.clone(), Origin::Remote, shared(Arc::new(adapter)))
            {
                Ok(true) => capabilities.push(name),
                Ok(false) => {}
                Err(e) => warn!(%server, capability = %name, error = %e, "skipping capability"),
            }
        }

        let registered = capabilities.len();
        connections.insert(
            server.clone(),
            Attached {
                connection,
                capabilities,
            },
        );
        info!(%server, registered, "attached capability server");
        Ok(registered)
    }

    /// Close every connection in server-name order. Returns how many failed
    /// to close cleanly.
    pub async fn close_all(&self) -> usize {
        let mut drained: Vec<(String, Attached)> =
            self.connections.lock().await.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        let mut failures = 0;
        for (server, attached) in drained {
            if let Err(e) = attached.connection.close().await {
                warn!(%server, error = %e, "failed to close capability server");
                failures += 1;
            }
        }
        failures
    }

    /// Close one server and unregister the capabilities it registered.
    ///
    /// Entries registered by other servers are left alone, even when their
    /// names share this server's prefix. Returns the number of registry
    /// entries removed.
    pub async fn remove_server(&self, server: &str) -> Result<usize> {
        let Some(attached) = self.connections.lock().await.remove(server) else {
            warn!(server, "remove of unknown capability server");
            return Ok(0);
        };

        let removed = attached
            .capabilities
            .iter()
            .filter(|name| self.registry.unregister(name))
            .count();
        attached.connection.close().await?;
        info!(server, removed, "removed capability server");
        Ok(removed)
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn contains(&self, server: &str) -> bool {
        self.connections.lock().await.contains_key(server)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

async fn handshake(connection: &dyn Connection) -> bridge::Result<Vec<CapabilityInfo>> {
    let info = connection.initialize().await?;
    debug!(server = connection.server_name(), remote = %info.name, "initialized");
    connection.list_capabilities().await
}

async fn close_quietly(connection: &dyn Connection) {
    if let Err(e) = connection.close().await {
        debug!(server = connection.server_name(), error = %e, "close after failed attach");
    }
}
