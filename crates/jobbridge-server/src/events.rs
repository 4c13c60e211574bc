//! External job events as published by workers on a job's channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use jobbridge_core::JobId;
use jobbridge_rpc::RpcError;
use jobbridge_rpc::errors::UPSTREAM_ERROR;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{BackendError, PubSub};
use crate::correlation::JobUpdate;

fn default_worker_code() -> i64 {
    UPSTREAM_ERROR
}

/// Failure reported by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerError {
    /// Error code (defaults to the generic upstream code).
    #[serde(default = "default_worker_code")]
    pub code: i64,
    /// Message forwarded to clients.
    pub message: String,
    /// Optional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of a message on a job channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobEvent {
    /// Job finished successfully.
    Success {
        /// Result value.
        #[serde(default)]
        result: Value,
    },
    /// Job failed.
    Error {
        /// Failure details.
        error: WorkerError,
    },
    /// Job is still running.
    Progress {
        /// Completion percentage.
        percent: f64,
        /// Status message.
        #[serde(default)]
        message: String,
        /// Sequence number for de-duplication.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl JobEvent {
    /// Parse a channel payload.
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Whether the event ends the job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

impl From<JobEvent> for JobUpdate {
    fn from(event: JobEvent) -> Self {
        match event {
            JobEvent::Success { result } => Self::Completed(result),
            JobEvent::Error { error } => Self::Failed(RpcError::Upstream {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            JobEvent::Progress {
                percent,
                message,
                seq,
            } => Self::Progress {
                percent,
                message,
                seq,
            },
        }
    }
}

/// Publishes events for workers written against [`PubSub`].
#[derive(Clone)]
pub struct EventPublisher {
    pubsub: Arc<dyn PubSub>,
    channel_prefix: String,
    next_seq: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Publish on `<channel_prefix><job_id>`.
    pub fn new(pubsub: Arc<dyn PubSub>, channel_prefix: impl Into<String>) -> Self {
        Self {
            pubsub,
            channel_prefix: channel_prefix.into(),
            next_seq: Arc::default(),
        }
    }

    /// Channel carrying events for `job_id`.
    pub fn channel_for(&self, job_id: &JobId) -> String {
        format!("{}{job_id}", self.channel_prefix)
    }

    /// Publish a progress event with a fresh sequence number.
    pub async fn progress(
        &self,
        job_id: &JobId,
        percent: f64,
        message: impl Into<String>,
    ) -> Result<(), BackendError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.publish(
            job_id,
            &JobEvent::Progress {
                percent,
                message: message.into(),
                seq: Some(seq),
            },
        )
        .await
    }

    /// Publish a success event.
    pub async fn succeed(&self, job_id: &JobId, result: Value) -> Result<(), BackendError> {
        self.publish(job_id, &JobEvent::Success { result }).await
    }

    /// Publish a failure event.
    pub async fn fail(
        &self,
        job_id: &JobId,
        code: i64,
        message: impl Into<String>,
    ) -> Result<(), BackendError> {
        let error = WorkerError {
            code,
            message: message.into(),
            data: None,
        };
        self.publish(job_id, &JobEvent::Error { error }).await
    }

    /// Publish any event.
    pub async fn publish(&self, job_id: &JobId, event: &JobEvent) -> Result<(), BackendError> {
        let payload = serde_json::to_string(event)?;
        self.pubsub.publish(&self.channel_for(job_id), &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBroker;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_success() {
        let event = JobEvent::parse(r#"{"kind":"success","result":{"n":1}}"#).unwrap();
        assert_eq!(event, JobEvent::Success { result: json!({"n": 1}) });
        assert!(event.is_terminal());
    }

    #[test]
    fn parse_error_defaults_code() {
        let event = JobEvent::parse(r#"{"kind":"error","error":{"message":"boom"}}"#).unwrap();
        let update = JobUpdate::from(event);
        assert_matches!(
            update,
            JobUpdate::Failed(RpcError::Upstream { code: UPSTREAM_ERROR, ref message, data: None }) if message == "boom"
        );
    }

    #[test]
    fn parse_error_keeps_worker_code_and_data() {
        let event = JobEvent::parse(
            r#"{"kind":"error","error":{"code":-32050,"message":"quota","data":{"left":0}}}"#,
        )
        .unwrap();
        let JobUpdate::Failed(err) = JobUpdate::from(event) else {
            panic!("expected failure");
        };
        assert_eq!(err.code(), -32_050);
        assert_eq!(err.to_error_body().data, Some(json!({"left": 0})));
    }

    #[test]
    fn parse_progress() {
        let event = JobEvent::parse(r#"{"kind":"progress","percent":40,"message":"working","seq":3}"#)
            .unwrap();
        assert!(!event.is_terminal());
        assert_eq!(
            JobUpdate::from(event),
            JobUpdate::Progress {
                percent: 40.0,
                message: "working".into(),
                seq: Some(3)
            }
        );
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!(JobEvent::parse(r#"{"kind":"restarted"}"#).is_err());
        assert!(JobEvent::parse("not json").is_err());
    }

    #[tokio::test]
    async fn publisher_formats_events() {
        let broker = MemoryBroker::new();
        let listener = broker.client();
        let mut rx = listener.take_messages().unwrap();
        listener.subscribe("jobs:j1").await.unwrap();

        let publisher = EventPublisher::new(Arc::new(broker.client()), "jobs:");
        let id = JobId::from("j1");
        publisher.progress(&id, 50.0, "half").await.unwrap();
        publisher.progress(&id, 90.0, "almost").await.unwrap();
        publisher.succeed(&id, json!("ok")).await.unwrap();

        let first = JobEvent::parse(&rx.recv().await.unwrap().payload).unwrap();
        assert_matches!(first, JobEvent::Progress { seq: Some(1), .. });
        let second = JobEvent::parse(&rx.recv().await.unwrap().payload).unwrap();
        assert_matches!(second, JobEvent::Progress { seq: Some(2), .. });
        let last = rx.recv().await.unwrap();
        assert_eq!(last.channel, "jobs:j1");
        assert_eq!(JobEvent::parse(&last.payload).unwrap(), JobEvent::Success { result: json!("ok") });
    }
}
