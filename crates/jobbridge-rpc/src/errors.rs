//! RPC error codes and error type.

use std::time::Duration;

use jobbridge_core::JobId;

use crate::types::RpcErrorBody;
use crate::validation::sanitize_error_message;

// ── Error code constants ────────────────────────────────────────────

/// Frame is not valid JSON.
pub const PARSE_ERROR: i64 = -32_700;
/// Frame is JSON but not a valid request.
pub const INVALID_REQUEST: i64 = -32_600;
/// Method not found in the registry.
pub const METHOD_NOT_FOUND: i64 = -32_601;
/// Parameters rejected by the method's rules.
pub const INVALID_PARAMS: i64 = -32_602;
/// Unexpected internal error.
pub const INTERNAL_ERROR: i64 = -32_603;
/// Watched job is unknown or already completed.
pub const JOB_NOT_FOUND: i64 = -32_001;
/// Worker reported a failure without its own code.
pub const UPSTREAM_ERROR: i64 = -32_002;
/// No terminal event before the subscription's maximum wait.
pub const TIMEOUT_ERROR: i64 = -32_003;
/// The queue rejected the submission.
pub const SUBMISSION_FAILED: i64 = -32_004;
/// Feature or backend not available.
pub const NOT_AVAILABLE: i64 = -32_005;

/// Errors surfaced to clients as the `error` member of a result frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// Frame could not be parsed as JSON.
    #[error("Parse error: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },

    /// Frame is structurally invalid (missing field, wrong type, reused id).
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// What is wrong.
        message: String,
    },

    /// Method is not in the capability table.
    #[error("Method '{method}' not found")]
    UnknownMethod {
        /// The requested method.
        method: String,
    },

    /// Parameters rejected by the method's rules.
    #[error("{message}")]
    InvalidParams {
        /// What is wrong.
        message: String,
    },

    /// Watched job is unknown, expired or already completed.
    #[error("Job '{job_id}' not found")]
    JobNotFound {
        /// The requested job.
        job_id: JobId,
    },

    /// Worker reported an execution failure.
    #[error("{message}")]
    Upstream {
        /// Worker-supplied code.
        code: i64,
        /// Worker-supplied message.
        message: String,
        /// Worker-supplied details.
        data: Option<serde_json::Value>,
    },

    /// Job did not reach a terminal state in time.
    #[error("Job '{job_id}' did not complete within {}s", waited.as_secs())]
    Timeout {
        /// The job that timed out.
        job_id: JobId,
        /// How long the gateway waited.
        waited: Duration,
    },

    /// The queue refused the job.
    #[error("Job submission failed: {message}")]
    SubmissionFailed {
        /// Backend message.
        message: String,
    },

    /// Feature or backend not available.
    #[error("{message}")]
    NotAvailable {
        /// Description.
        message: String,
    },

    /// Unexpected server failure.
    #[error("{message}")]
    Internal {
        /// Description (never sent to clients verbatim).
        message: String,
    },
}

impl RpcError {
    /// Integer wire code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse { .. } => PARSE_ERROR,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::UnknownMethod { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::JobNotFound { .. } => JOB_NOT_FOUND,
            Self::Upstream { code, .. } => *code,
            Self::Timeout { .. } => TIMEOUT_ERROR,
            Self::SubmissionFailed { .. } => SUBMISSION_FAILED,
            Self::NotAvailable { .. } => NOT_AVAILABLE,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Whether this error comes from the protocol layer (the client sent
    /// something invalid) rather than from job execution.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. } | Self::InvalidRequest { .. } | Self::InvalidParams { .. }
        )
    }

    /// Convert to the wire-format error body, sanitizing internal details.
    pub fn to_error_body(&self) -> RpcErrorBody {
        RpcErrorBody {
            code: self.code(),
            message: sanitize_error_message(self),
            data: match self {
                Self::Upstream { data, .. } => data.clone(),
                _ => None,
            },
        }
    }
}
