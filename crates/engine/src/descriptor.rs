//! Capability metadata shared by local handlers and server-discovered tools.

use std::time::Duration;

use mcp::ToolDef;
use policy::{ConfirmationPolicy, PermissionClass};
use serde_json::Value;

/// Default per-call deadline when neither the server nor the local
/// registration specifies one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a capability's handler lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilitySource {
    /// Registered in-process by the embedding application.
    Local,
    /// Discovered from the named external server.
    Server(String),
}

impl CapabilitySource {
    pub fn server_name(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Server(name) => Some(name),
        }
    }
}

/// Everything the engine needs to know about a capability before
/// invoking it.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object. `Value::Null` accepts any
    /// arguments.
    pub param_schema: Value,
    pub permission: PermissionClass,
    pub confirmation: ConfirmationPolicy,
    pub timeout: Duration,
    pub source: CapabilitySource,
}

impl CapabilityDescriptor {
    pub fn local(name: impl Into<String>, param_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            param_schema,
            permission: PermissionClass::None,
            confirmation: ConfirmationPolicy::default(),
            timeout: DEFAULT_CALL_TIMEOUT,
            source: CapabilitySource::Local,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn permission(mut self, permission: PermissionClass) -> Self {
        self.permission = permission;
        self
    }

    pub fn confirmation(mut self, confirmation: ConfirmationPolicy) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds a descriptor from a tool advertised by a server. Declared
    /// permissions collapse to the most destructive class they imply.
    pub fn from_tool_def(def: &ToolDef, server: &str) -> Self {
        let permission = permission_for(def);
        let confirmation = def
            .confirmation
            .as_deref()
            .and_then(parse_confirmation)
            .unwrap_or_default();
        let timeout = def
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CALL_TIMEOUT);
        Self {
            name: def.name.clone(),
            description: def.description.clone().unwrap_or_default(),
            param_schema: def.input_schema.clone(),
            permission,
            confirmation,
            timeout,
            source: CapabilitySource::Server(server.to_string()),
        }
    }
}

fn permission_for(def: &ToolDef) -> PermissionClass {
    use mcp::FilesystemAccess;
    let Some(perms) = &def.permissions else {
        return PermissionClass::None;
    };
    if perms.shell {
        PermissionClass::Shell
    } else if perms.filesystem == FilesystemAccess::Write {
        PermissionClass::Write
    } else if perms.network {
        PermissionClass::Network
    } else if perms.filesystem == FilesystemAccess::Read {
        PermissionClass::Read
    } else {
        PermissionClass::None
    }
}

fn parse_confirmation(raw: &str) -> Option<ConfirmationPolicy> {
    match raw {
        "never" => Some(ConfirmationPolicy::Never),
        "always" => Some(ConfirmationPolicy::Always),
        "destructive-only" => Some(ConfirmationPolicy::DestructiveOnly),
        "adaptive" => Some(ConfirmationPolicy::Adaptive),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp::{FilesystemAccess, ToolPermissions};
    use serde_json::json;

    fn def(name: &str) -> ToolDef {
        ToolDef {
            name: name.to_string(),
            description: Some("test tool".to_string()),
            input_schema: json!({"type": "object"}),
            permissions: None,
            confirmation: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn shell_dominates_other_permissions() {
        let mut d = def("run");
        d.permissions = Some(ToolPermissions {
            filesystem: FilesystemAccess::Write,
            network: true,
            shell: true,
        });
        let desc = CapabilityDescriptor::from_tool_def(&d, "srv");
        assert_eq!(desc.permission, PermissionClass::Shell);
        assert_eq!(desc.source, CapabilitySource::Server("srv".to_string()));
    }

    #[test]
    fn defaults_apply_for_sparse_tool_defs() {
        let desc = CapabilityDescriptor::from_tool_def(&def("plain"), "srv");
        assert_eq!(desc.permission, PermissionClass::None);
        assert_eq!(desc.confirmation, ConfirmationPolicy::default());
        assert_eq!(desc.timeout, DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn declared_confirmation_and_timeout_are_honored() {
        let mut d = def("careful");
        d.confirmation = Some("always".to_string());
        d.timeout_ms = Some(5_000);
        let desc = CapabilityDescriptor::from_tool_def(&d, "srv");
        assert_eq!(desc.confirmation, ConfirmationPolicy::Always);
        assert_eq!(desc.timeout, Duration::from_secs(5));
    }
}
