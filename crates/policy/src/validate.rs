//! Call validation: argument shape, then permission class.
//!
//! Pure checks, no I/O. The first schema violation short-circuits; a
//! permission failure never reaches the confirmation layer.

use crate::{Decision, PermissionClass, Policy};
use serde_json::Value;

/// Why a call was rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// Arguments do not match the capability's parameter schema.
    Schema(String),
    /// The capability's permission class exceeds the caller's trust.
    PermissionDenied(String),
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(msg) => write!(f, "invalid arguments: {msg}"),
            Self::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
        }
    }
}

/// Validate arguments against a JSON Schema, then the permission class
/// against the caller's policy. Check order matters: bad arguments are
/// reported even for calls the caller could never run, and a denied class
/// must not proceed to confirmation.
pub fn validate(
    arguments: &Value,
    param_schema: &Value,
    class: PermissionClass,
    policy: &Policy,
) -> Result<(), ValidationFailure> {
    check_schema(arguments, param_schema)?;
    match policy.check(class) {
        Decision::Allow => Ok(()),
        Decision::Deny { reason } => Err(ValidationFailure::PermissionDenied(reason)),
    }
}

fn check_schema(arguments: &Value, param_schema: &Value) -> Result<(), ValidationFailure> {
    // A null/absent schema means the capability takes anything.
    if param_schema.is_null() {
        return Ok(());
    }

    let compiled = jsonschema::JSONSchema::compile(param_schema)
        .map_err(|e| ValidationFailure::Schema(format!("unusable parameter schema: {e}")))?;

    if let Err(mut violations) = compiled.validate(arguments) {
        if let Some(first) = violations.next() {
            return Err(ValidationFailure::Schema(format!(
                "{} (at {})",
                first, first.instance_path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1}
            },
            "required": ["path"]
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let result = validate(
            &json!({"path": "./a.txt", "limit": 5}),
            &path_schema(),
            PermissionClass::Read,
            &Policy::permissive(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn first_schema_violation_short_circuits() {
        // Two violations: missing `path`, bad `limit`. Only the first
        // reported one comes back.
        let err = validate(
            &json!({"limit": 0}),
            &path_schema(),
            PermissionClass::Read,
            &Policy::permissive(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn schema_failure_reported_before_permission() {
        // Arguments are wrong AND the class is denied; the schema error
        // wins because it is checked first.
        let err = validate(
            &json!({}),
            &path_schema(),
            PermissionClass::Shell,
            &Policy::restrictive(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationFailure::Schema(_)));
    }

    #[test]
    fn permission_denied_when_class_exceeds_trust() {
        let err = validate(
            &json!({"path": "./a.txt"}),
            &path_schema(),
            PermissionClass::Shell,
            &Policy::restrictive(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationFailure::PermissionDenied(_)));
    }

    #[test]
    fn null_schema_accepts_anything() {
        let result = validate(
            &json!([1, 2, 3]),
            &Value::Null,
            PermissionClass::None,
            &Policy::restrictive(),
        );
        assert!(result.is_ok());
    }
}
