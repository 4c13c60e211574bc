//! Notification Router: bridges per-job pub/sub channels to the
//! Correlation Table.
//!
//! The router holds exactly one channel subscription per live job entry. It
//! subscribes before the job is submitted and unsubscribes when the table
//! announces the entry was pruned.

use std::collections::HashSet;
use std::sync::Arc;

use jobbridge_core::JobId;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ChannelMessage, PubSub};
use crate::correlation::{CorrelationTable, Resolution};
use crate::events::JobEvent;
use crate::metrics::EVENTS_DROPPED_TOTAL;

/// Routes external job events to waiting connections.
pub struct NotificationRouter {
    pubsub: Arc<dyn PubSub>,
    table: Arc<CorrelationTable>,
    channel_prefix: String,
    watched: Mutex<HashSet<JobId>>,
}

impl NotificationRouter {
    /// Create a router reading job channels named `<channel_prefix><job_id>`.
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        table: Arc<CorrelationTable>,
        channel_prefix: impl Into<String>,
    ) -> Self {
        Self {
            pubsub,
            table,
            channel_prefix: channel_prefix.into(),
            watched: Mutex::new(HashSet::new()),
        }
    }

    /// Channel carrying events for `job_id`.
    pub fn channel_for(&self, job_id: &JobId) -> String {
        format!("{}{job_id}", self.channel_prefix)
    }

    /// Job named by `channel`, if it is one of ours.
    pub fn job_for_channel(&self, channel: &str) -> Option<JobId> {
        channel
            .strip_prefix(&self.channel_prefix)
            .filter(|rest| !rest.is_empty())
            .map(JobId::from)
    }

    /// Make sure the job's channel is subscribed. Must complete before the
    /// job is submitted, or a fast worker's result could be missed.
    pub async fn watch_channel(&self, job_id: &JobId) -> Result<(), BackendError> {
        let newly_watched = self.watched.lock().insert(job_id.clone());
        if newly_watched {
            if let Err(e) = self.pubsub.subscribe(&self.channel_for(job_id)).await {
                let _ = self.watched.lock().remove(job_id);
                return Err(e);
            }
            debug!(job_id = %job_id, "job channel subscribed");
        }
        // The entry may have been pruned while subscribing; its prune notice
        // could have been handled before the subscription existed.
        if !self.table.contains(job_id) {
            self.release(job_id).await;
        }
        Ok(())
    }

    /// Drop the job's channel subscription.
    pub async fn release(&self, job_id: &JobId) {
        let _ = self.watched.lock().remove(job_id);
        match self.pubsub.unsubscribe(&self.channel_for(job_id)).await {
            Ok(()) => debug!(job_id = %job_id, "job channel released"),
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to unsubscribe job channel"),
        }
    }

    /// Whether the router holds a subscription for `job_id`.
    pub fn is_watching(&self, job_id: &JobId) -> bool {
        self.watched.lock().contains(job_id)
    }

    /// Number of channel subscriptions held.
    pub fn watched_count(&self) -> usize {
        self.watched.lock().len()
    }

    /// Resolve one external message. Returns `None` when the message was not
    /// a well-formed event for one of our channels.
    pub fn handle_message(&self, message: &ChannelMessage) -> Option<Resolution> {
        let Some(job_id) = self.job_for_channel(&message.channel) else {
            debug!(channel = %message.channel, "message on foreign channel dropped");
            counter!(EVENTS_DROPPED_TOTAL, "reason" => "foreign_channel").increment(1);
            return None;
        };
        let event = match JobEvent::parse(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "unparseable job event dropped");
                counter!(EVENTS_DROPPED_TOTAL, "reason" => "unparseable").increment(1);
                return None;
            }
        };

        let resolution = self.table.resolve(&job_id, event.into());
        match resolution {
            Resolution::Dropped => {
                debug!(job_id = %job_id, "event for unknown or completed job dropped");
                counter!(EVENTS_DROPPED_TOTAL, "reason" => "unknown_job").increment(1);
            }
            Resolution::DuplicateProgress => {
                counter!(EVENTS_DROPPED_TOTAL, "reason" => "duplicate_progress").increment(1);
            }
            _ => {}
        }
        Some(resolution)
    }

    /// Router loop: consume external messages and prune notices until
    /// `cancel` fires or either stream ends.
    pub async fn run(
        self: Arc<Self>,
        mut pruned_rx: mpsc::UnboundedReceiver<JobId>,
        cancel: CancellationToken,
    ) {
        let Some(mut messages) = self.pubsub.take_messages() else {
            warn!("pub/sub message stream already taken, router not started");
            return;
        };
        info!(prefix = %self.channel_prefix, "notification router started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                pruned = pruned_rx.recv() => match pruned {
                    Some(job_id) => self.release(&job_id).await,
                    None => break,
                },
                message = messages.recv() => match message {
                    Some(message) => {
                        let _ = self.handle_message(&message);
                    }
                    None => {
                        warn!("pub/sub message stream ended");
                        break;
                    }
                },
            }
        }
        info!("notification router stopped");
    }
}
