//! The capability registry: one namespace for local handlers and
//! server-discovered tools.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcp::ToolDef;
use policy::PermissionClass;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::descriptor::{CapabilityDescriptor, CapabilitySource};
use crate::error::{Error, Result};

/// An in-process capability. Returning `Err` reports a handler-level
/// failure; the engine surfaces it as an unsuccessful result without an
/// error kind, matching how remote tools report their own failures.
#[async_trait]
pub trait LocalCapability: Send + Sync {
    async fn invoke(&self, arguments: Value) -> std::result::Result<Value, String>;
}

/// How a registered capability is invoked.
#[derive(Clone)]
pub enum CapabilityHandler {
    Local(Arc<dyn LocalCapability>),
    Remote { server: String },
}

impl std::fmt::Debug for CapabilityHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Remote { server } => write!(f, "Remote({server})"),
        }
    }
}

/// A descriptor paired with the handler that executes it.
#[derive(Debug, Clone)]
pub struct RegisteredCapability {
    pub descriptor: CapabilityDescriptor,
    pub handler: CapabilityHandler,
}

/// Narrows [`CapabilityRegistry::list`]. An empty filter matches
/// everything.
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    pub source: Option<CapabilitySource>,
    pub permission: Option<PermissionClass>,
    pub name_prefix: Option<String>,
}

impl CapabilityFilter {
    fn matches(&self, descriptor: &CapabilityDescriptor) -> bool {
        if let Some(source) = &self.source {
            if &descriptor.source != source {
                return false;
            }
        }
        if let Some(permission) = self.permission {
            if descriptor.permission != permission {
                return false;
            }
        }
        if let Some(prefix) = &self.name_prefix {
            if !descriptor.name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Thread-safe name-to-capability map.
///
/// By default a later registration under an existing name replaces the
/// earlier one (logged at info). [`CapabilityRegistry::forbid_overwrite`]
/// turns that into an error instead.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<String, Arc<RegisteredCapability>>>,
    forbid_overwrite: bool,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forbid_overwrite() -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
            forbid_overwrite: true,
        }
    }

    pub async fn register(
        &self,
        descriptor: CapabilityDescriptor,
        handler: CapabilityHandler,
    ) -> Result<()> {
        let name = descriptor.name.clone();
        let entry = Arc::new(RegisteredCapability {
            descriptor,
            handler,
        });
        let mut map = self.capabilities.write().await;
        if map.contains_key(&name) {
            if self.forbid_overwrite {
                return Err(Error::DuplicateCapability(name));
            }
            info!(capability = %name, "replacing existing capability registration");
        }
        map.insert(name, entry);
        Ok(())
    }

    pub async fn resolve(&self, name: &str) -> Option<Arc<RegisteredCapability>> {
        self.capabilities.read().await.get(name).cloned()
    }

    /// Snapshot of matching capabilities, sorted by name.
    pub async fn list(&self, filter: &CapabilityFilter) -> Vec<Arc<RegisteredCapability>> {
        let map = self.capabilities.read().await;
        let mut matched: Vec<_> = map
            .values()
            .filter(|c| filter.matches(&c.descriptor))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        matched
    }

    pub async fn len(&self) -> usize {
        self.capabilities.read().await.len()
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.capabilities.write().await.remove(name).is_some()
    }

    /// Replace everything tagged with `server` by the given tool set.
    /// Used on connect and reconnect, when the server's full inventory is
    /// known.
    pub async fn sync_server(&self, server: &str, tools: &[ToolDef]) {
        let mut map = self.capabilities.write().await;
        map.retain(|_, c| c.descriptor.source.server_name() != Some(server));
        for def in tools {
            let descriptor = CapabilityDescriptor::from_tool_def(def, server);
            let entry = Arc::new(RegisteredCapability {
                descriptor,
                handler: CapabilityHandler::Remote {
                    server: server.to_string(),
                },
            });
            map.insert(def.name.clone(), entry);
        }
        debug!(server, count = tools.len(), "synchronized server capabilities");
    }

    /// Apply an incremental tool diff from a reconnected server.
    pub async fn apply_diff(&self, server: &str, added: &[ToolDef], removed: &[String]) {
        let mut map = self.capabilities.write().await;
        for name in removed {
            if let Some(existing) = map.get(name) {
                if existing.descriptor.source.server_name() == Some(server) {
                    map.remove(name);
                }
            }
        }
        for def in added {
            let descriptor = CapabilityDescriptor::from_tool_def(def, server);
            let entry = Arc::new(RegisteredCapability {
                descriptor,
                handler: CapabilityHandler::Remote {
                    server: server.to_string(),
                },
            });
            map.insert(def.name.clone(), entry);
        }
        debug!(
            server,
            added = added.len(),
            removed = removed.len(),
            "applied capability diff"
        );
    }

    /// Drop every capability tagged with `server`. Returns how many were
    /// removed.
    pub async fn unregister_server(&self, server: &str) -> usize {
        let mut map = self.capabilities.write().await;
        let before = map.len();
        map.retain(|_, c| c.descriptor.source.server_name() != Some(server));
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl LocalCapability for Echo {
        async fn invoke(&self, arguments: Value) -> std::result::Result<Value, String> {
            Ok(arguments)
        }
    }

    fn tool(name: &str) -> ToolDef {
        ToolDef {
            name: name.to_string(),
            description: None,
            input_schema: Value::Null,
            permissions: None,
            confirmation: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn register_and_resolve_round_trip() {
        let registry = CapabilityRegistry::new();
        let descriptor = CapabilityDescriptor::local("echo", json!({"type": "object"}));
        registry
            .register(descriptor, CapabilityHandler::Local(Arc::new(Echo)))
            .await
            .unwrap();

        let found = registry.resolve("echo").await.unwrap();
        assert_eq!(found.descriptor.name, "echo");
        assert!(registry.resolve("missing").await.is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_by_default_and_errors_when_forbidden() {
        let registry = CapabilityRegistry::new();
        let first = CapabilityDescriptor::local("dup", Value::Null).describe("first");
        let second = CapabilityDescriptor::local("dup", Value::Null).describe("second");
        registry
            .register(first.clone(), CapabilityHandler::Local(Arc::new(Echo)))
            .await
            .unwrap();
        registry
            .register(second, CapabilityHandler::Local(Arc::new(Echo)))
            .await
            .unwrap();
        assert_eq!(registry.resolve("dup").await.unwrap().descriptor.description, "second");

        let strict = CapabilityRegistry::forbid_overwrite();
        strict
            .register(first.clone(), CapabilityHandler::Local(Arc::new(Echo)))
            .await
            .unwrap();
        let err = strict
            .register(first, CapabilityHandler::Local(Arc::new(Echo)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateCapability(name) if name == "dup"));
    }

    #[tokio::test]
    async fn sync_server_replaces_only_that_servers_entries() {
        let registry = CapabilityRegistry::new();
        registry
            .register(
                CapabilityDescriptor::local("local_cap", Value::Null),
                CapabilityHandler::Local(Arc::new(Echo)),
            )
            .await
            .unwrap();
        registry.sync_server("alpha", &[tool("a1"), tool("a2")]).await;
        registry.sync_server("beta", &[tool("b1")]).await;
        assert_eq!(registry.len().await, 4);

        // Re-sync alpha with a smaller inventory; beta and locals survive.
        registry.sync_server("alpha", &[tool("a2")]).await;
        assert!(registry.resolve("a1").await.is_none());
        assert!(registry.resolve("a2").await.is_some());
        assert!(registry.resolve("b1").await.is_some());
        assert!(registry.resolve("local_cap").await.is_some());
    }

    #[tokio::test]
    async fn apply_diff_adds_and_removes() {
        let registry = CapabilityRegistry::new();
        registry.sync_server("srv", &[tool("old"), tool("keep")]).await;
        registry
            .apply_diff("srv", &[tool("new")], &["old".to_string()])
            .await;
        assert!(registry.resolve("old").await.is_none());
        assert!(registry.resolve("new").await.is_some());
        assert!(registry.resolve("keep").await.is_some());
    }

    #[tokio::test]
    async fn unregister_server_leaves_other_sources() {
        let registry = CapabilityRegistry::new();
        registry
            .register(
                CapabilityDescriptor::local("mine", Value::Null),
                CapabilityHandler::Local(Arc::new(Echo)),
            )
            .await
            .unwrap();
        registry.sync_server("gone", &[tool("g1"), tool("g2")]).await;

        let removed = registry.unregister_server("gone").await;
        assert_eq!(removed, 2);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn list_applies_filters() {
        let registry = CapabilityRegistry::new();
        registry
            .register(
                CapabilityDescriptor::local("fs_read", Value::Null)
                    .permission(PermissionClass::Read),
                CapabilityHandler::Local(Arc::new(Echo)),
            )
            .await
            .unwrap();
        registry
            .register(
                CapabilityDescriptor::local("fs_write", Value::Null)
                    .permission(PermissionClass::Write),
                CapabilityHandler::Local(Arc::new(Echo)),
            )
            .await
            .unwrap();
        registry.sync_server("srv", &[tool("remote_cap")]).await;

        let all = registry.list(&CapabilityFilter::default()).await;
        assert_eq!(all.len(), 3);
        // Sorted by name.
        assert_eq!(all[0].descriptor.name, "fs_read");

        let writes = registry
            .list(&CapabilityFilter {
                permission: Some(PermissionClass::Write),
                ..Default::default()
            })
            .await;
        assert_eq!(writes.len(), 1);

        let local_fs = registry
            .list(&CapabilityFilter {
                source: Some(CapabilitySource::Local),
                name_prefix: Some("fs_".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(local_fs.len(), 2);
    }
}
