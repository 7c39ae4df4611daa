//! Orchestrator configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mcp::ServerConfig;
use policy::{ConfirmationPolicy, PermissionClass, Policy};
use serde::Deserialize;
use serde_json::Value;

use crate::descriptor::{CapabilityDescriptor, DEFAULT_CALL_TIMEOUT};
use crate::engine::DEFAULT_CONCURRENCY;
use crate::error::{Error, Result};

/// Top-level configuration file.
///
/// ```toml
/// [engine]
/// concurrency = 4
///
/// [policy]
/// trust = "standard"
/// deny = ["shell"]
///
/// [audit]
/// path = "capstan.db"
///
/// [[server]]
/// name = "files"
/// transport = "pipe"
/// command = "mcp-filesystem"
///
/// [[capability]]
/// name = "search_notes"
/// permission = "read"
/// confirmation = "never"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapstanConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub audit: AuditSettings,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
    #[serde(default, rename = "capability")]
    pub capabilities: Vec<DescriptorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Deadline for capabilities that do not declare their own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Make re-registering an existing capability name an error instead
    /// of a replacement.
    #[serde(default)]
    pub forbid_overwrite: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_timeout_ms: default_timeout_ms(),
            forbid_overwrite: false,
        }
    }
}

/// Where the audit trail goes. No path means no persistence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditSettings {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Declared metadata for a locally registered capability. The handler is
/// attached programmatically; this only carries what the registry needs.
#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments, written as an inline TOML table.
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub permission: PermissionClass,
    #[serde(default)]
    pub confirmation: ConfirmationPolicy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl DescriptorConfig {
    pub fn into_descriptor(self, default_timeout: Duration) -> CapabilityDescriptor {
        CapabilityDescriptor::local(self.name, self.schema.unwrap_or(Value::Null))
            .describe(self.description)
            .permission(self.permission)
            .confirmation(self.confirmation)
            .timeout(
                self.timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_timeout),
            )
    }
}

impl CapstanConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::parse(&content)
    }

    pub fn parse(toml: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.default_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        for server in &self.servers {
            server.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(&server.name) {
                return Err(Error::Config(format!(
                    "duplicate server name {:?}",
                    server.name
                )));
            }
        }
        Ok(())
    }
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp::TransportKind;
    use policy::TrustLevel;

    #[test]
    fn parses_a_full_config() {
        let config = CapstanConfig::parse(
            r#"
            [engine]
            concurrency = 8
            forbid_overwrite = true

            [policy]
            trust = "read_only"
            deny = ["shell"]

            [audit]
            path = "/var/lib/capstan/audit.db"

            [[server]]
            name = "files"
            transport = "pipe"
            command = "mcp-filesystem"
            args = ["--root", "/home"]

            [[server]]
            name = "search"
            transport = "stream"
            url = "https://search.internal/rpc"
            retry_attempts = 5

            [server.auth]
            type = "api-key"
            key = "secret"

            [[capability]]
            name = "summarize"
            description = "Summarize a document"
            permission = "read"
            confirmation = "never"
            timeout_ms = 5000

            [capability.schema]
            type = "object"
            required = ["path"]
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.concurrency, 8);
        assert!(config.engine.forbid_overwrite);
        assert_eq!(config.policy.trust, TrustLevel::ReadOnly);
        assert!(config.audit.path.is_some());

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[1].transport, TransportKind::Stream);
        assert_eq!(config.servers[1].retry_attempts, Some(5));
        assert!(config.servers[1].auth.is_some());

        let descriptor = config.capabilities[0]
            .clone()
            .into_descriptor(config.default_timeout());
        assert_eq!(descriptor.name, "summarize");
        assert_eq!(descriptor.permission, PermissionClass::Read);
        assert_eq!(descriptor.timeout, Duration::from_secs(5));
        assert_eq!(descriptor.param_schema["required"][0], "path");
    }

    #[test]
    fn empty_config_gets_defaults() {
        let config = CapstanConfig::parse("").unwrap();
        assert_eq!(config.engine.concurrency, DEFAULT_CONCURRENCY);
        assert!(config.servers.is_empty());
        assert!(config.audit.path.is_none());
    }

    #[test]
    fn invalid_server_is_rejected() {
        let err = CapstanConfig::parse(
            r#"
            [[server]]
            name = "broken"
            transport = "request"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn duplicate_server_names_are_rejected() {
        let err = CapstanConfig::parse(
            r#"
            [[server]]
            name = "twin"
            transport = "pipe"
            command = "a"

            [[server]]
            name = "twin"
            transport = "pipe"
            command = "b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
