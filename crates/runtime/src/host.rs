//! Startup wiring: builtins, remote servers and the execution manager.

use std::sync::Arc;

use tracing::info;

use crate::builtin;
use crate::config::ToolsConfig;
use crate::manager::ExecutionManager;
use crate::registry::Registry;
use crate::remote::Discovery;

/// Everything needed to serve capability calls.
pub struct ToolHost {
    manager: ExecutionManager,
    discovery: Discovery,
}

impl ToolHost {
    /// Register the configured builtins, discover the configured servers and
    /// build an execution manager over `registry`.
    ///
    /// Servers that fail to start are logged and skipped.
    pub async fn start(registry: Arc<Registry>, config: &ToolsConfig) -> Self {
        let builtins = builtin::register_builtins(&registry, &config.builtins);

        let discovery = Discovery::new(Arc::clone(&registry));
        let servers = discovery.discover_all(&config.servers).await;

        info!(
            builtins,
            servers,
            configured_servers = config.servers.len(),
            capabilities = registry.len(),
            "tool host ready"
        );

        Self {
            manager: ExecutionManager::new(registry, config.execution.clone()),
            discovery,
        }
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.manager
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Close every remote server. Returns how many failed to close cleanly.
    pub async fn shutdown(&self) -> usize {
        self.discovery.close_all().await
    }
}
