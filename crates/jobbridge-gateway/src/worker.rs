//! Development loopback worker for the memory backend.
//!
//! Consumes the in-process queue and answers every job with two progress
//! events and a success result echoing the request.

use std::time::Duration;

use jobbridge_server::EventPublisher;
use jobbridge_server::backend::QueuedJob;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between the loopback worker's events.
const STEP_DELAY: Duration = Duration::from_millis(250);

/// Serve jobs until `cancel` fires or the queue closes.
pub async fn run(
    mut jobs: mpsc::UnboundedReceiver<QueuedJob>,
    publisher: EventPublisher,
    cancel: CancellationToken,
) {
    info!("loopback worker started");
    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let publisher = publisher.clone();
        let _handle = tokio::spawn(async move {
            if let Err(e) = process(&publisher, job).await {
                warn!(error = %e, "loopback worker failed to publish");
            }
        });
    }
    info!("loopback worker stopped");
}

async fn process(
    publisher: &EventPublisher,
    job: QueuedJob,
) -> Result<(), jobbridge_server::backend::BackendError> {
    debug!(job_id = %job.job_id, method = %job.method, "loopback job");
    tokio::time::sleep(STEP_DELAY).await;
    publisher.progress(&job.job_id, 50.0, "working").await?;
    tokio::time::sleep(STEP_DELAY).await;
    publisher.progress(&job.job_id, 100.0, "finishing").await?;
    publisher
        .succeed(
            &job.job_id,
            json!({"method": job.method, "params": job.params, "echo": true}),
        )
        .await
}
