//! Result pipeline: folds remote call outcomes into the uniform
//! [`CapabilityResult`] shape and maps protocol failures onto the error
//! taxonomy.

use std::time::Duration;

use mcp::{codes, CallToolResult, ToolContent};
use serde_json::Value;

use crate::call::{CallId, CapabilityResult, ErrorKind};

/// Map a JSON-RPC error code onto the taxonomy.
pub fn kind_for_code(code: i32) -> ErrorKind {
    match code {
        codes::REQUEST_TIMEOUT => ErrorKind::Timeout,
        codes::AUTH_FAILED => ErrorKind::Authentication,
        codes::TRANSPORT_ERROR => ErrorKind::Network,
        codes::METHOD_NOT_FOUND => ErrorKind::NotFound,
        codes::INVALID_PARAMS => ErrorKind::Validation,
        _ => ErrorKind::Protocol,
    }
}

/// Map a client-side failure onto the taxonomy.
pub fn kind_for_error(error: &mcp::Error) -> ErrorKind {
    match error {
        mcp::Error::JsonRpc(e) => kind_for_code(e.code),
        mcp::Error::Timeout { .. } => ErrorKind::Timeout,
        mcp::Error::AuthFailed(_) => ErrorKind::Authentication,
        mcp::Error::Serialize(_) | mcp::Error::InvalidResponse(_) => ErrorKind::Protocol,
        _ => ErrorKind::Network,
    }
}

/// Collapse a `tools/call` content list into a single output value.
///
/// A single JSON item passes through untouched; text items are joined with
/// newlines; an empty list becomes `null`.
pub fn collapse_content(content: Vec<ToolContent>) -> Value {
    if content.is_empty() {
        return Value::Null;
    }
    if content.len() == 1 {
        if let ToolContent::Json { json } = &content[0] {
            return json.clone();
        }
    }
    let text: Vec<String> = content
        .into_iter()
        .map(|item| match item {
            ToolContent::Text { text } => text,
            ToolContent::Json { json } => json.to_string(),
        })
        .collect();
    Value::String(text.join("\n"))
}

/// Fold a remote call outcome into a [`CapabilityResult`].
///
/// A server-reported tool failure (`isError`) is an unsuccessful result
/// with no taxonomy kind; the tool ran and reported its own error payload.
pub fn remote_result(
    call_id: CallId,
    outcome: Result<CallToolResult, mcp::Error>,
    duration: Duration,
) -> CapabilityResult {
    match outcome {
        Ok(result) => {
            let is_error = result.is_error;
            let output = collapse_content(result.content);
            if is_error {
                CapabilityResult::handler_failure(call_id, output, duration)
            } else {
                CapabilityResult::success(call_id, output, duration)
            }
        }
        Err(error) => CapabilityResult::failure(
            call_id,
            Some(kind_for_error(&error)),
            error.to_string(),
            duration,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp::JsonRpcError;
    use serde_json::json;

    #[test]
    fn code_mapping_covers_implementation_defined_range() {
        assert_eq!(kind_for_code(codes::REQUEST_TIMEOUT), ErrorKind::Timeout);
        assert_eq!(kind_for_code(codes::AUTH_FAILED), ErrorKind::Authentication);
        assert_eq!(kind_for_code(codes::TRANSPORT_ERROR), ErrorKind::Network);
        assert_eq!(kind_for_code(codes::PARSE_ERROR), ErrorKind::Protocol);
        assert_eq!(kind_for_code(codes::INTERNAL_ERROR), ErrorKind::Protocol);
        assert_eq!(kind_for_code(codes::SERVER_ERROR), ErrorKind::Protocol);
        assert_eq!(kind_for_code(codes::METHOD_NOT_FOUND), ErrorKind::NotFound);
    }

    #[test]
    fn client_errors_map_to_taxonomy() {
        let timeout = mcp::Error::Timeout {
            method: "tools/call".to_string(),
        };
        assert_eq!(kind_for_error(&timeout), ErrorKind::Timeout);

        let auth = mcp::Error::AuthFailed("401".to_string());
        assert_eq!(kind_for_error(&auth), ErrorKind::Authentication);

        let rpc = mcp::Error::JsonRpc(JsonRpcError {
            code: codes::TRANSPORT_ERROR,
            message: "gateway unreachable".to_string(),
            data: None,
        });
        assert_eq!(kind_for_error(&rpc), ErrorKind::Network);

        assert_eq!(
            kind_for_error(&mcp::Error::ConnectionClosed),
            ErrorKind::Network
        );
    }

    #[test]
    fn single_json_item_passes_through() {
        let out = collapse_content(vec![ToolContent::Json {
            json: json!({"rows": 3}),
        }]);
        assert_eq!(out, json!({"rows": 3}));
    }

    #[test]
    fn text_items_join_with_newlines() {
        let out = collapse_content(vec![
            ToolContent::Text { text: "one".to_string() },
            ToolContent::Text { text: "two".to_string() },
        ]);
        assert_eq!(out, json!("one\ntwo"));
        assert_eq!(collapse_content(vec![]), Value::Null);
    }

    #[test]
    fn server_reported_tool_failure_has_no_kind() {
        let result = CallToolResult {
            content: vec![ToolContent::Text {
                text: "file not readable".to_string(),
            }],
            is_error: true,
        };
        let folded = remote_result(CallId::new(), Ok(result), Duration::from_millis(5));
        assert!(!folded.success);
        assert!(folded.error_kind.is_none());
        assert_eq!(folded.output, json!("file not readable"));
    }

    #[test]
    fn transport_failure_becomes_network_kind() {
        let folded = remote_result(
            CallId::new(),
            Err(mcp::Error::NotConnected),
            Duration::from_millis(5),
        );
        assert!(!folded.success);
        assert_eq!(folded.error_kind, Some(ErrorKind::Network));
    }
}
