//! External collaborators: the durable job queue and the pub/sub channel.
//!
//! The core only talks to these traits. [`memory`] provides an in-process
//! implementation (tests, single-node development); `redis` (behind the
//! `redis` feature) talks to a Redis server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobbridge_core::JobId;
use serde::{Deserialize, Serialize};
use metrics::counter;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::metrics::EVENTS_DROPPED_TOTAL;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{MemoryBroker, MemoryPubSub, MemoryQueue};

/// Backend failures.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend cannot be reached or has shut down.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend does not implement this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    /// Envelope serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Redis client error.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// A job as handed to the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    /// Gateway-assigned job identifier (also names the event channel).
    pub job_id: JobId,
    /// Method the client called.
    pub method: String,
    /// Parameters the client sent.
    pub params: Map<String, Value>,
    /// When the gateway enqueued the job.
    pub submitted_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Build an envelope stamped with the current time.
    pub fn new(job_id: JobId, method: &str, params: &Map<String, Value>) -> Self {
        Self {
            job_id,
            method: method.to_owned(),
            params: params.clone(),
            submitted_at: Utc::now(),
        }
    }
}

/// Job Submission Adapter: enqueues jobs without waiting for completion.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Enqueue a job.
    async fn submit(
        &self,
        method: &str,
        params: &Map<String, Value>,
        job_id: &JobId,
    ) -> Result<(), BackendError>;

    /// Ask workers to stop a job. Best effort; nothing is guaranteed.
    async fn cancel(&self, _job_id: &JobId) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("cancel"))
    }
}

/// A message received on a subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Channel name.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// Inbound messages buffered per pub/sub client before new ones are dropped.
pub const INBOUND_CAPACITY: usize = 8192;

/// Hand `message` to the router without blocking. A full buffer drops the
/// message; returns `true` only if it was enqueued.
fn forward(tx: &mpsc::Sender<ChannelMessage>, message: ChannelMessage) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            warn!(channel = %message.channel, "inbound event buffer full, dropping event");
            counter!(EVENTS_DROPPED_TOTAL, "reason" => "inbound_full").increment(1);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// External pub/sub. Delivery is assumed at-least-once.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Start receiving messages published on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<(), BackendError>;
    /// Stop receiving messages published on `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError>;
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError>;
    /// Take the inbound message stream. Returns `None` after the first call.
    fn take_messages(&self) -> Option<mpsc::Receiver<ChannelMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCancel;

    #[async_trait]
    impl JobSubmitter for NoCancel {
        async fn submit(
            &self,
            _method: &str,
            _params: &Map<String, Value>,
            _job_id: &JobId,
        ) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_defaults_to_unsupported() {
        let err = NoCancel.cancel(&JobId::from("j1")).await.unwrap_err();
        assert!(matches!(err, BackendError::Unsupported("cancel")));
    }

    #[test]
    fn queued_job_envelope_shape() {
        let mut params = Map::new();
        let _ = params.insert("input".into(), Value::from("x"));
        let job = QueuedJob::new(JobId::from("j1"), "data.process", &params);
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["jobId"], "j1");
        assert_eq!(v["method"], "data.process");
        assert_eq!(v["params"]["input"], "x");
        assert!(v["submittedAt"].is_string());
    }
}
