//! In-process queue and pub/sub.
//!
//! A [`MemoryBroker`] stands in for the shared pub/sub server: each gateway
//! instance (or worker) gets its own [`MemoryPubSub`] client, and a publish
//! fans out to every client subscribed to the channel. Several gateway
//! instances can therefore share one broker in tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use jobbridge_core::JobId;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{BackendError, ChannelMessage, INBOUND_CAPACITY, JobSubmitter, PubSub, QueuedJob, forward};

// ── Queue ───────────────────────────────────────────────────────────

/// Unbounded in-process job queue. Workers read the receiver returned by
/// [`MemoryQueue::new`].
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    cancel_requests: Mutex<Vec<JobId>>,
}

impl MemoryQueue {
    /// Create a queue and the receiving end workers consume.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            cancel_requests: Mutex::new(Vec::new()),
        };
        (queue, rx)
    }

    /// Whether cancellation was requested for `job_id`.
    pub fn cancel_requested(&self, job_id: &JobId) -> bool {
        self.cancel_requests.lock().contains(job_id)
    }
}

#[async_trait]
impl JobSubmitter for MemoryQueue {
    async fn submit(
        &self,
        method: &str,
        params: &Map<String, Value>,
        job_id: &JobId,
    ) -> Result<(), BackendError> {
        self.tx
            .send(QueuedJob::new(job_id.clone(), method, params))
            .map_err(|_| BackendError::Unavailable("queue has no consumer".into()))
    }

    async fn cancel(&self, job_id: &JobId) -> Result<(), BackendError> {
        self.cancel_requests.lock().push(job_id.clone());
        Ok(())
    }
}

// ── Pub/sub ─────────────────────────────────────────────────────────

struct ClientShared {
    channels: Mutex<HashSet<String>>,
    tx: mpsc::Sender<ChannelMessage>,
}

/// Shared in-process message bus.
#[derive(Default)]
pub struct MemoryBroker {
    clients: RwLock<Vec<Arc<ClientShared>>>,
}

impl MemoryBroker {
    /// Create a broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a new client attached to this broker.
    pub fn client(self: &Arc<Self>) -> MemoryPubSub {
        self.client_with_capacity(INBOUND_CAPACITY)
    }

    /// Create a client that buffers at most `capacity` undelivered messages.
    pub fn client_with_capacity(self: &Arc<Self>, capacity: usize) -> MemoryPubSub {
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(ClientShared {
            channels: Mutex::new(HashSet::new()),
            tx,
        });
        self.clients.write().push(Arc::clone(&shared));
        MemoryPubSub {
            broker: Arc::clone(self),
            shared,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Deliver `payload` to every client subscribed to `channel`. Returns
    /// the number of receivers.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut receivers = 0;
        let mut saw_closed = false;
        for client in self.clients.read().iter() {
            if client.tx.is_closed() {
                saw_closed = true;
                continue;
            }
            if client.channels.lock().contains(channel) {
                let msg = ChannelMessage {
                    channel: channel.to_owned(),
                    payload: payload.to_owned(),
                };
                if forward(&client.tx, msg) {
                    receivers += 1;
                }
            }
        }
        if saw_closed {
            self.clients.write().retain(|c| !c.tx.is_closed());
        }
        debug!(channel, receivers, "memory broker publish");
        receivers
    }

    /// Number of clients subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.clients
            .read()
            .iter()
            .filter(|c| !c.tx.is_closed() && c.channels.lock().contains(channel))
            .count()
    }
}

/// One client of a [`MemoryBroker`].
pub struct MemoryPubSub {
    broker: Arc<MemoryBroker>,
    shared: Arc<ClientShared>,
    rx: Mutex<Option<mpsc::Receiver<ChannelMessage>>>,
}

impl MemoryPubSub {
    /// Whether this client is subscribed to `channel`.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.shared.channels.lock().contains(channel)
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, channel: &str) -> Result<(), BackendError> {
        let _ = self.shared.channels.lock().insert(channel.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError> {
        let _ = self.shared.channels.lock().remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError> {
        let _ = self.broker.publish(channel, payload);
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<ChannelMessage>> {
        self.rx.lock().take()
    }
}
