//! Call and result types that flow through the execution engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a single capability invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A request to invoke a named capability with JSON arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCall {
    pub id: CallId,
    pub name: String,
    pub arguments: Value,
    pub issued_at: DateTime<Utc>,
}

impl CapabilityCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: CallId::new(),
            name: name.into(),
            arguments,
            issued_at: Utc::now(),
        }
    }
}

/// Classifies why a call failed. Every failed result carries at most one
/// kind; handler-reported failures (a capability returning its own error
/// payload) carry none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    UserRejected,
    CheckpointFailed,
    Timeout,
    Network,
    Protocol,
    Authentication,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PermissionDenied => "permission_denied",
            Self::UserRejected => "user_rejected",
            Self::CheckpointFailed => "checkpoint_failed",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Authentication => "authentication",
            Self::NotFound => "not_found",
        }
    }

    /// Whether a caller could reasonably retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and size facts recorded for every completed call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CallMetadata {
    pub duration_ms: u64,
    pub bytes_produced: u64,
}

/// Uniform outcome of a capability call, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResult {
    pub call_id: CallId,
    pub success: bool,
    pub output: Value,
    pub error_kind: Option<ErrorKind>,
    pub metadata: CallMetadata,
}

impl CapabilityResult {
    pub fn success(call_id: CallId, output: Value, duration: std::time::Duration) -> Self {
        let bytes = payload_bytes(&output);
        Self {
            call_id,
            success: true,
            output,
            error_kind: None,
            metadata: CallMetadata {
                duration_ms: duration.as_millis() as u64,
                bytes_produced: bytes,
            },
        }
    }

    /// Unsuccessful result carrying the handler's own error payload.
    /// No taxonomy kind: the capability ran and reported the failure
    /// itself.
    pub fn handler_failure(call_id: CallId, output: Value, duration: std::time::Duration) -> Self {
        let bytes = payload_bytes(&output);
        Self {
            call_id,
            success: false,
            output,
            error_kind: None,
            metadata: CallMetadata {
                duration_ms: duration.as_millis() as u64,
                bytes_produced: bytes,
            },
        }
    }

    pub fn failure(
        call_id: CallId,
        kind: Option<ErrorKind>,
        message: impl Into<String>,
        duration: std::time::Duration,
    ) -> Self {
        let output = Value::String(message.into());
        let bytes = payload_bytes(&output);
        Self {
            call_id,
            success: false,
            output,
            error_kind: kind,
            metadata: CallMetadata {
                duration_ms: duration.as_millis() as u64,
                bytes_produced: bytes,
            },
        }
    }
}

fn payload_bytes(output: &Value) -> u64 {
    match serde_json::to_vec(output) {
        Ok(bytes) => bytes.len() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn success_result_measures_output() {
        let r = CapabilityResult::success(CallId::new(), json!({"ok": true}), Duration::from_millis(12));
        assert!(r.success);
        assert!(r.error_kind.is_none());
        assert_eq!(r.metadata.duration_ms, 12);
        assert!(r.metadata.bytes_produced > 0);
    }

    #[test]
    fn failure_result_carries_kind() {
        let r = CapabilityResult::failure(
            CallId::new(),
            Some(ErrorKind::Timeout),
            "deadline exceeded",
            Duration::from_secs(30),
        );
        assert!(!r.success);
        assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
        assert!(r.error_kind.map(|k| k.is_retryable()).unwrap_or(false));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let v = serde_json::to_value(ErrorKind::PermissionDenied).unwrap();
        assert_eq!(v, json!("permission_denied"));
    }
}
