//! Wire-format frames exchanged with clients over the WebSocket.
//!
//! Every server frame carries `"jsonrpc": "2.0"`. Optional identifiers on
//! [`ResultFrame`] serialize as `null` rather than being omitted, so clients
//! can rely on the keys being present.

use jobbridge_core::JobId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RpcError;

/// Protocol version string carried in every frame.
pub const JSONRPC_VERSION: &str = "2.0";

fn version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// A validated request from a client.
///
/// Produced by [`crate::validation::parse_request`]; `params` is always an
/// object (an absent `params` becomes `{}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Method name, e.g. `data.process` or `watch`.
    pub method: String,
    /// Parameters object.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Client-chosen request identifier, unique among that connection's
    /// in-flight requests.
    pub id: String,
    /// Existing job to watch, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// Immediate acknowledgment that a job was accepted or is being watched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Always `true`.
    pub ack: bool,
    /// The job the request is now correlated with.
    pub job_id: JobId,
    /// Echoed request identifier.
    pub id: String,
}

impl AckFrame {
    /// Build an ack for `job_id` answering request `id`.
    pub fn new(job_id: JobId, id: impl Into<String>) -> Self {
        Self {
            jsonrpc: version(),
            ack: true,
            job_id,
            id: id.into(),
        }
    }
}

/// Structured error inside a [`ResultFrame`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Integer error code (see [`crate::errors`]).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Final outcome of a request: a job result, a job failure, or a protocol
/// error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFrame {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Result payload, `null` on error.
    pub result: Option<Value>,
    /// Error payload, `null` on success.
    pub error: Option<RpcErrorBody>,
    /// Request identifier this frame answers; `null` when the offending
    /// frame had no parseable id.
    pub id: Option<String>,
    /// Job this frame belongs to; `null` for errors raised before a job
    /// existed.
    pub job_id: Option<JobId>,
}

impl ResultFrame {
    /// Build a success frame.
    pub fn success(id: impl Into<String>, job_id: JobId, result: Value) -> Self {
        Self {
            jsonrpc: version(),
            result: Some(result),
            error: None,
            id: Some(id.into()),
            job_id: Some(job_id),
        }
    }

    /// Build a success reply to a control method (`ping`, `unwatch`,
    /// `cancel`), which may not concern any job.
    pub fn reply(id: impl Into<String>, job_id: Option<JobId>, result: Value) -> Self {
        Self {
            jsonrpc: version(),
            result: Some(result),
            error: None,
            id: Some(id.into()),
            job_id,
        }
    }

    /// Build a failure frame from a wire error body.
    pub fn failure(id: Option<String>, job_id: Option<JobId>, error: RpcErrorBody) -> Self {
        Self {
            jsonrpc: version(),
            result: None,
            error: Some(error),
            id,
            job_id,
        }
    }

    /// Build a failure frame from an [`RpcError`].
    pub fn from_error(id: Option<String>, job_id: Option<JobId>, error: &RpcError) -> Self {
        Self::failure(id, job_id, error.to_error_body())
    }

    /// Whether this frame reports success.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Best-effort progress update for a pending job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressFrame {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Always `"progress"`.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Job the update belongs to.
    pub job_id: JobId,
    /// Completion percentage as reported by the worker.
    pub percent: f64,
    /// Free-form status message.
    pub message: String,
}

impl ProgressFrame {
    /// Build a progress frame.
    pub fn new(job_id: JobId, percent: f64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: version(),
            frame_type: "progress".into(),
            job_id,
            percent,
            message: message.into(),
        }
    }
}

/// Sent once after a connection authenticated successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedFrame {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Always `"connected"`.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Server-assigned connection identifier.
    pub connection_id: String,
    /// Authenticated subject.
    pub subject: String,
}

impl ConnectedFrame {
    /// Build a connected frame.
    pub fn new(connection_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            jsonrpc: version(),
            frame_type: "connected".into(),
            connection_id: connection_id.into(),
            subject: subject.into(),
        }
    }
}

/// Credential frame a client sends first when it could not attach a bearer
/// token to the upgrade request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthFrame {
    /// Must be `"auth"`.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Bearer token.
    pub token: String,
}

impl AuthFrame {
    /// Parse an auth frame, returning `None` for anything else.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str::<Self>(text)
            .ok()
            .filter(|f| f.frame_type == "auth" && !f.token.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_frame_shape() {
        let ack = AckFrame::new(JobId::from("abc123"), "r1");
        let v = serde_json::to_value(&ack).unwrap();
        assert_eq!(
            v,
            json!({"jsonrpc": "2.0", "ack": true, "jobId": "abc123", "id": "r1"})
        );
    }

    #[test]
    fn success_result_has_null_error() {
        let frame = ResultFrame::success("r1", JobId::from("abc123"), json!({"out": 1}));
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["result"]["out"], 1);
        assert!(v["error"].is_null());
        assert_eq!(v["id"], "r1");
        assert_eq!(v["jobId"], "abc123");
        assert!(frame.is_success());
    }

    #[test]
    fn protocol_error_serializes_null_ids() {
        let frame = ResultFrame::from_error(
            None,
            None,
            &RpcError::Parse {
                message: "bad".into(),
            },
        );
        let v = serde_json::to_value(&frame).unwrap();
        assert!(v.get("id").is_some());
        assert!(v["id"].is_null());
        assert!(v["jobId"].is_null());
        assert!(v["result"].is_null());
        assert_eq!(v["error"]["code"], -32700);
        assert!(v["error"].get("data").is_none());
        assert!(!frame.is_success());
    }

    #[test]
    fn control_reply_without_job() {
        let frame = ResultFrame::reply("p1", None, json!({"pong": true}));
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["result"]["pong"], true);
        assert!(v["jobId"].is_null());
        assert!(v["error"].is_null());
    }

    #[test]
    fn progress_frame_shape() {
        let frame = ProgressFrame::new(JobId::from("abc123"), 40.0, "halfway-ish");
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "progress");
        assert_eq!(v["jobId"], "abc123");
        assert_eq!(v["percent"], 40.0);
        assert_eq!(v["message"], "halfway-ish");
        assert_eq!(v["jsonrpc"], "2.0");
    }

    #[test]
    fn connected_frame_shape() {
        let frame = ConnectedFrame::new("conn_1", "user-7");
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "connected");
        assert_eq!(v["connectionId"], "conn_1");
        assert_eq!(v["subject"], "user-7");
    }

    #[test]
    fn auth_frame_parse() {
        let f = AuthFrame::parse(r#"{"type":"auth","token":"abc"}"#).unwrap();
        assert_eq!(f.token, "abc");
        assert!(AuthFrame::parse(r#"{"type":"hello","token":"abc"}"#).is_none());
        assert!(AuthFrame::parse(r#"{"type":"auth","token":""}"#).is_none());
        assert!(AuthFrame::parse("not json").is_none());
    }

    #[test]
    fn request_omits_absent_job_id() {
        let req = RpcRequest {
            method: "data.process".into(),
            params: Map::new(),
            id: "r1".into(),
            job_id: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("jobId").is_none());
        assert_eq!(v["params"], json!({}));
    }
}
