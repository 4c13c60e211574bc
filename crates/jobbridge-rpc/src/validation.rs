//! Inbound frame validation.
//!
//! [`parse_request`] turns one text frame into an [`RpcRequest`] or a
//! [`FrameError`] that already knows which request id (if any) the error
//! response must reference.

use jobbridge_core::JobId;
use serde_json::{Map, Value};

use crate::errors::RpcError;
use crate::types::{JSONRPC_VERSION, RpcRequest};

/// Maximum request id length in bytes.
pub const MAX_REQUEST_ID_LENGTH: usize = 256;

/// Maximum method name length in bytes.
pub const MAX_METHOD_LENGTH: usize = 128;

/// Default cap on the serialized size of `params` (64 KB).
pub const DEFAULT_MAX_PARAMS_BYTES: usize = 65_536;

/// A frame that failed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameError {
    /// Request id to echo, `None` when the frame had no usable id.
    pub id: Option<String>,
    /// Job id to echo, when the frame carried one.
    pub job_id: Option<JobId>,
    /// What went wrong.
    pub error: RpcError,
}

impl FrameError {
    fn invalid(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            job_id: None,
            error: RpcError::InvalidRequest {
                message: message.into(),
            },
        }
    }
}

/// Parse and structurally validate one inbound text frame.
///
/// Checks run in this order: JSON syntax, object shape, `id`, `jsonrpc`,
/// `method`, `params`, `jobId`. Once `id` is known every later failure
/// references it.
pub fn parse_request(text: &str) -> Result<RpcRequest, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameError {
        id: None,
        job_id: None,
        error: RpcError::Parse {
            message: e.to_string(),
        },
    })?;

    let Value::Object(mut obj) = value else {
        return Err(FrameError::invalid(None, "request must be a JSON object"));
    };

    let id = match obj.remove("id") {
        Some(Value::String(s)) if !s.is_empty() && s.len() <= MAX_REQUEST_ID_LENGTH => s,
        Some(Value::String(s)) if s.len() > MAX_REQUEST_ID_LENGTH => {
            return Err(FrameError::invalid(
                None,
                format!("'id' exceeds maximum length ({MAX_REQUEST_ID_LENGTH})"),
            ));
        }
        Some(_) => {
            return Err(FrameError::invalid(None, "'id' must be a non-empty string"));
        }
        None => return Err(FrameError::invalid(None, "missing 'id'")),
    };

    match obj.remove("jsonrpc") {
        None => {}
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(_) => {
            return Err(FrameError::invalid(Some(id), "'jsonrpc' must be \"2.0\""));
        }
    }

    let method = match obj.remove("method") {
        Some(Value::String(m)) if !m.is_empty() && m.len() <= MAX_METHOD_LENGTH => m,
        Some(Value::String(m)) if m.len() > MAX_METHOD_LENGTH => {
            return Err(FrameError::invalid(Some(id), "'method' is too long"));
        }
        Some(_) => {
            return Err(FrameError::invalid(
                Some(id),
                "'method' must be a non-empty string",
            ));
        }
        None => return Err(FrameError::invalid(Some(id), "missing 'method'")),
    };

    let job_id = match obj.remove("jobId") {
        None | Some(Value::Null) => None,
        Some(Value::String(j)) if !j.is_empty() && j.len() <= MAX_REQUEST_ID_LENGTH => {
            Some(JobId::from(j))
        }
        Some(_) => {
            return Err(FrameError::invalid(
                Some(id),
                "'jobId' must be a non-empty string",
            ));
        }
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(p)) => p,
        Some(_) => {
            return Err(FrameError {
                id: Some(id),
                job_id,
                error: RpcError::InvalidRequest {
                    message: "'params' must be an object".into(),
                },
            });
        }
    };

    Ok(RpcRequest {
        method,
        params,
        id,
        job_id,
    })
}

/// Reject `params` whose serialized form exceeds `max_bytes`.
pub fn validate_params_size(params: &Map<String, Value>, max_bytes: usize) -> Result<(), RpcError> {
    let size = serde_json::to_vec(params).map_or(usize::MAX, |v| v.len());
    if size > max_bytes {
        return Err(RpcError::InvalidParams {
            message: format!("params exceed maximum size ({size} > {max_bytes} bytes)"),
        });
    }
    Ok(())
}

/// Validate that a string parameter does not exceed `max_len` bytes.
pub fn validate_string_param(value: &str, name: &str, max_len: usize) -> Result<(), RpcError> {
    if value.len() > max_len {
        return Err(RpcError::InvalidParams {
            message: format!(
                "Parameter '{name}' exceeds maximum length ({} > {max_len})",
                value.len()
            ),
        });
    }
    Ok(())
}

/// Sanitize an error message for client consumption.
///
/// Internal errors lose their details (addresses, paths); everything else is
/// already user-facing.
pub fn sanitize_error_message(err: &RpcError) -> String {
    match err {
        RpcError::Internal { .. } => "Internal error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{INVALID_PARAMS, INVALID_REQUEST, PARSE_ERROR};
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_submit_request() {
        let req = parse_request(
            r#"{"jsonrpc":"2.0","method":"data.process","params":{"input":"x"},"id":"r1"}"#,
        )
        .unwrap();
        assert_eq!(req.method, "data.process");
        assert_eq!(req.id, "r1");
        assert_eq!(req.params["input"], "x");
        assert!(req.job_id.is_none());
    }

    #[test]
    fn parses_watch_request_without_params() {
        let req = parse_request(r#"{"method":"watch","id":"r2","jobId":"abc123"}"#).unwrap();
        assert_eq!(req.job_id.as_deref(), Some("abc123"));
        assert!(req.params.is_empty());
    }

    #[test]
    fn unparseable_json_is_parse_error_with_null_id() {
        let err = parse_request("{not json").unwrap_err();
        assert!(err.id.is_none());
        assert_eq!(err.error.code(), PARSE_ERROR);
    }

    #[test]
    fn non_object_is_invalid_request() {
        let err = parse_request("[1,2,3]").unwrap_err();
        assert!(err.id.is_none());
        assert_eq!(err.error.code(), INVALID_REQUEST);
    }

    #[test]
    fn missing_id_references_null() {
        let err = parse_request(r#"{"method":"data.process"}"#).unwrap_err();
        assert!(err.id.is_none());
        assert_matches!(err.error, RpcError::InvalidRequest { .. });
    }

    #[test]
    fn numeric_id_rejected() {
        let err = parse_request(r#"{"method":"m","id":7}"#).unwrap_err();
        assert!(err.id.is_none());
        assert_eq!(err.error.code(), INVALID_REQUEST);
    }

    #[test]
    fn oversized_id_rejected() {
        let id = "x".repeat(MAX_REQUEST_ID_LENGTH + 1);
        let frame = json!({"method": "m", "id": id}).to_string();
        let err = parse_request(&frame).unwrap_err();
        assert!(err.id.is_none());
    }

    #[test]
    fn missing_method_references_id() {
        let err = parse_request(r#"{"id":"r9"}"#).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("r9"));
        assert_eq!(err.error.code(), INVALID_REQUEST);
    }

    #[test]
    fn wrong_jsonrpc_version_rejected() {
        let err = parse_request(r#"{"jsonrpc":"1.0","method":"m","id":"r1"}"#).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("r1"));
        assert!(err.error.to_string().contains("2.0"));
    }

    #[test]
    fn array_params_rejected() {
        let err = parse_request(r#"{"method":"m","id":"r1","params":[1]}"#).unwrap_err();
        assert_eq!(err.error.code(), INVALID_REQUEST);
    }

    #[test]
    fn empty_job_id_rejected() {
        let err = parse_request(r#"{"method":"watch","id":"r1","jobId":""}"#).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("r1"));
    }

    #[test]
    fn params_size_limit() {
        let mut params = Map::new();
        let _ = params.insert("blob".into(), json!("x".repeat(100)));
        assert!(validate_params_size(&params, 1_000).is_ok());
        let err = validate_params_size(&params, 50).unwrap_err();
        assert_eq!(err.code(), INVALID_PARAMS);
    }

    #[test]
    fn string_param_at_limit_succeeds() {
        let s = "x".repeat(16);
        assert!(validate_string_param(&s, "input", 16).is_ok());
        let err = validate_string_param(&s, "input", 15).unwrap_err();
        assert!(err.to_string().contains("input"));
    }

    #[test]
    fn sanitize_internal_error_strips_details() {
        let err = RpcError::Internal {
            message: "failed at /var/lib/jobbridge: disk full".into(),
        };
        let sanitized = sanitize_error_message(&err);
        assert_eq!(sanitized, "Internal error");
    }

    #[test]
    fn sanitize_invalid_params_preserves_message() {
        let err = RpcError::InvalidParams {
            message: "Missing required parameter 'input'".into(),
        };
        assert!(sanitize_error_message(&err).contains("input"));
    }
}
