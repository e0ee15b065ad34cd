//! Integration Registry (C3): the snapshot of tools discovered across
//! every configured MCP server, plus dispatch.
//!
//! Publishes via atomic swap: readers always see one consistent
//! snapshot, writers never block them. The per-server session cache is
//! the one place with real contention (concurrent callers racing to
//! (re)handshake the same server), so it gets its own per-server mutex
//! rather than sharing the snapshot's lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::auth::TokenCache;

use super::client::{McpClient, ToolDescriptor, ToolResult};
use super::config::McpServerConfig;
use super::session::{McpSession, McpTimeouts};
use super::McpError;

/// Immutable point-in-time view of every tool available across all
/// servers. Readers hold a cheap `Arc` clone; nothing here is mutated
/// in place.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub tools: Vec<ToolDescriptor>,
    pub by_name: HashMap<String, String>,
}

/// Which subset of the registry's tools a caller wants exposed to the
/// LLM for one turn.
#[derive(Debug, Clone, Default)]
pub struct ToolSelection {
    pub enable_tools: bool,
    pub enabled: Option<HashSet<String>>,
}

impl ToolSelection {
    pub fn all() -> Self {
        Self {
            enable_tools: true,
            enabled: None,
        }
    }

    pub fn none() -> Self {
        Self {
            enable_tools: false,
            enabled: None,
        }
    }

    fn includes(&self, name: &str) -> bool {
        if !self.enable_tools {
            return false;
        }
        match &self.enabled {
            None => true,
            Some(set) if set.is_empty() => true,
            Some(set) => set.contains(name),
        }
    }
}

struct ServerEntry {
    client: McpClient,
    session: Mutex<Option<McpSession>>,
}

/// Owns every configured MCP server, the discovery snapshot, and the
/// per-server session cache.
pub struct IntegrationRegistry {
    servers: HashMap<String, ServerEntry>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl IntegrationRegistry {
    /// Credentials are resolved fresh on every request rather than at
    /// construction time, so this never touches the network itself —
    /// an OAuth2 server can be unreachable at startup without blocking it.
    pub fn new(configs: Vec<McpServerConfig>, auth_cache: Arc<TokenCache>) -> Result<Self, McpError> {
        Self::with_timeouts(configs, auth_cache, McpTimeouts::default())
    }

    pub fn with_timeouts(
        configs: Vec<McpServerConfig>,
        auth_cache: Arc<TokenCache>,
        timeouts: McpTimeouts,
    ) -> Result<Self, McpError> {
        let mut servers = HashMap::new();
        for config in configs {
            let server_name = config.name.clone();
            let client = McpClient::with_timeouts(config, auth_cache.clone(), timeouts)?;
            servers.insert(
                server_name,
                ServerEntry {
                    client,
                    session: Mutex::new(None),
                },
            );
        }
        Ok(Self {
            servers,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        })
    }

    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Filters the current snapshot's tools according to `selection`.
    pub async fn tools_for(&self, selection: &ToolSelection) -> Vec<ToolDescriptor> {
        self.snapshot()
            .await
            .tools
            .iter()
            .filter(|t| selection.includes(&t.name))
            .cloned()
            .collect()
    }

    /// Concurrently re-discovers tools from every server and publishes
    /// a fresh snapshot via atomic swap. Collisions on tool name keep
    /// the first server seen and log a warning for the rest.
    pub async fn refresh(&self) {
        let names: Vec<&String> = self.servers.keys().collect();
        let discoveries = futures::future::join_all(names.iter().map(|name| async move {
            let entry = &self.servers[name.as_str()];
            let result = self.discover_for(entry).await;
            (name.to_string(), result)
        }))
        .await;

        let mut tools = Vec::new();
        let mut by_name = HashMap::new();
        for (server_name, result) in discoveries {
            match result {
                Ok(discovered) => {
                    for tool in discovered {
                        if by_name.contains_key(&tool.name) {
                            tracing::warn!(
                                tool = tool.name,
                                server = server_name,
                                "tool name collision, keeping first registration"
                            );
                            continue;
                        }
                        by_name.insert(tool.name.clone(), server_name.clone());
                        tools.push(tool);
                    }
                }
                Err(e) => {
                    tracing::warn!(server = server_name, error = %e, "tool discovery failed");
                }
            }
        }

        let new_snapshot = Arc::new(RegistrySnapshot { tools, by_name });
        *self.snapshot.write().await = new_snapshot;
    }

    async fn discover_for(&self, entry: &ServerEntry) -> Result<Vec<ToolDescriptor>, McpError> {
        let session = self.ensure_session(entry).await?;
        entry.client.discover_tools(&session).await
    }

    async fn ensure_session(&self, entry: &ServerEntry) -> Result<McpSession, McpError> {
        let mut guard = entry.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = entry.client.establish_session().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Looks up the owning server for `name` in the current snapshot,
    /// reuses (or establishes) its session, and dispatches the call.
    pub async fn execute_tool_call(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolResult, McpError> {
        let snapshot = self.snapshot().await;
        let server_name = snapshot
            .by_name
            .get(name)
            .ok_or_else(|| McpError::UnknownTool(name.to_string()))?;
        let entry = self
            .servers
            .get(server_name)
            .ok_or_else(|| McpError::UnknownTool(name.to_string()))?;
        let session = self.ensure_session(entry).await?;
        entry.client.invoke_tool(&session, name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_selection_all_includes_everything() {
        let sel = ToolSelection::all();
        assert!(sel.includes("anything"));
    }

    #[test]
    fn tool_selection_none_excludes_everything() {
        let sel = ToolSelection::none();
        assert!(!sel.includes("anything"));
    }

    #[test]
    fn tool_selection_enabled_subset_filters_by_name() {
        let mut set = HashSet::new();
        set.insert("search".to_string());
        let sel = ToolSelection {
            enable_tools: true,
            enabled: Some(set),
        };
        assert!(sel.includes("search"));
        assert!(!sel.includes("fetch"));
    }

    #[test]
    fn tool_selection_empty_enabled_set_means_all() {
        let sel = ToolSelection {
            enable_tools: true,
            enabled: Some(HashSet::new()),
        };
        assert!(sel.includes("anything"));
    }
}
