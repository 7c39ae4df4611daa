//! Permission classes, confirmation policies and trust levels.

use serde::{Deserialize, Serialize};

/// What a capability is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionClass {
    /// Pure computation, no side effects.
    #[default]
    None,
    Read,
    Write,
    Shell,
    Network,
}

impl PermissionClass {
    /// Relative risk weight, used by the adaptive confirmation heuristic.
    pub fn weight(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Read => 1,
            Self::Network => 2,
            Self::Write => 3,
            Self::Shell => 4,
        }
    }

    /// Classes that mutate state outside the process.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Write | Self::Shell)
    }
}

/// When a capability call needs explicit approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationPolicy {
    Never,
    Always,
    #[default]
    DestructiveOnly,
    Adaptive,
}

/// How much the current caller is trusted.
///
/// Permits table:
///
/// | trust     | none | read | network | write | shell |
/// |-----------|------|------|---------|-------|-------|
/// | untrusted | yes  | no   | no      | no    | no    |
/// | read_only | yes  | yes  | no      | no    | no    |
/// | standard  | yes  | yes  | yes     | yes   | no    |
/// | full      | yes  | yes  | yes     | yes   | yes   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    ReadOnly,
    #[default]
    Standard,
    Full,
}

impl TrustLevel {
    pub fn permits(&self, class: PermissionClass) -> bool {
        use PermissionClass as P;
        match self {
            Self::Untrusted => matches!(class, P::None),
            Self::ReadOnly => matches!(class, P::None | P::Read),
            Self::Standard => !matches!(class, P::Shell),
            Self::Full => true,
        }
    }
}
