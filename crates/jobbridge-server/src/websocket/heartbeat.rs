//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::{ClientConnection, EnqueueError, Outbound};

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client did not acknowledge a probe within the grace period.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Periodic liveness probe for one connection.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    interval: Duration,
    grace: Duration,
}

impl HeartbeatMonitor {
    /// Probe every `interval`; a probe unanswered after `grace` is fatal.
    pub fn new(interval: Duration, grace: Duration) -> Self {
        Self { interval, grace }
    }

    /// Run until the connection times out or `cancel` fires.
    ///
    /// Each cycle waits `interval`, clears the alive flag, enqueues a Ping
    /// and waits `grace`. Any inbound frame in the meantime sets the flag
    /// again. A full outbound buffer still counts as a probe: the client
    /// has the whole grace period to prove it is reading.
    pub async fn run(&self, connection: Arc<ClientConnection>, cancel: CancellationToken) -> HeartbeatResult {
        loop {
            tokio::select! {
                () = time::sleep(self.interval) => {}
                () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            }

            connection.clear_alive();
            if let Err(EnqueueError::Closed) = connection.enqueue(Outbound::Ping) {
                return HeartbeatResult::Cancelled;
            }

            tokio::select! {
                () = time::sleep(self.grace) => {}
                () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            }

            if !connection.is_alive() {
                debug!(conn_id = %connection.id, idle_ms = connection.idle_for().as_millis(), "heartbeat probe unanswered");
                return HeartbeatResult::TimedOut;
            }
        }
    }
}
