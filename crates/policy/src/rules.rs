//! Trust rules loaded from TOML.

use crate::{Error, PermissionClass, Result, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Result of a permission check.
#[derive(Debug, Clone)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Caller trust configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// The caller's trust level; permission classes above it are rejected.
    #[serde(default)]
    pub trust: TrustLevel,

    /// Permission classes denied outright, regardless of trust.
    #[serde(default)]
    pub deny: HashSet<PermissionClass>,
}

impl Policy {
    /// Load policy from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse policy from a TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Read-only trust with shell denied outright.
    pub fn restrictive() -> Self {
        let mut deny = HashSet::new();
        deny.insert(PermissionClass::Shell);
        Self {
            trust: TrustLevel::ReadOnly,
            deny,
        }
    }

    /// Full trust, nothing denied.
    pub fn permissive() -> Self {
        Self {
            trust: TrustLevel::Full,
            deny: HashSet::new(),
        }
    }

    /// Check a permission class against this policy.
    pub fn check(&self, class: PermissionClass) -> Decision {
        if self.deny.contains(&class) {
            return Decision::Deny {
                reason: format!("{class:?} is denied by policy"),
            };
        }
        if !self.trust.permits(class) {
            return Decision::Deny {
                reason: format!("{class:?} exceeds trust level {:?}", self.trust),
            };
        }
        Decision::Allow
    }
}
