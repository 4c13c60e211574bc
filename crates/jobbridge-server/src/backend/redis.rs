//! Redis-backed queue and pub/sub.
//!
//! Jobs are `LPUSH`ed as JSON [`QueuedJob`] envelopes onto the queue key;
//! workers `BRPOP` them. Cancellation requests are published on
//! `<queue_key>:cancel`. Events arrive through one pattern subscription on
//! `<channel_prefix>*`; per-job interest is tracked locally so channel churn
//! costs no round trips.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use jobbridge_core::JobId;
use parking_lot::{Mutex, RwLock};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{BackendError, ChannelMessage, INBOUND_CAPACITY, JobSubmitter, PubSub, QueuedJob, forward};

/// Queue on a Redis list.
pub struct RedisQueue {
    conn: MultiplexedConnection,
    queue_key: String,
}

impl RedisQueue {
    /// Connect to `address` and push onto `queue_key`.
    pub async fn connect(address: &str, queue_key: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(address)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(queue_key, "connected redis job queue");
        Ok(Self {
            conn,
            queue_key: queue_key.to_owned(),
        })
    }

    fn cancel_channel(&self) -> String {
        format!("{}:cancel", self.queue_key)
    }
}

#[async_trait]
impl JobSubmitter for RedisQueue {
    async fn submit(
        &self,
        method: &str,
        params: &Map<String, Value>,
        job_id: &JobId,
    ) -> Result<(), BackendError> {
        let payload = serde_json::to_string(&QueuedJob::new(job_id.clone(), method, params))?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(&self.queue_key, payload).await?;
        Ok(())
    }

    async fn cancel(&self, job_id: &JobId) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(self.cancel_channel(), job_id.as_str()).await?;
        Ok(())
    }
}

/// Pub/sub over one Redis pattern subscription.
pub struct RedisPubSub {
    publisher: MultiplexedConnection,
    channels: Arc<RwLock<HashSet<String>>>,
    rx: Mutex<Option<mpsc::Receiver<ChannelMessage>>>,
    reader: JoinHandle<()>,
}

impl RedisPubSub {
    /// Connect to `address` and pattern-subscribe to `<channel_prefix>*`.
    pub async fn connect(address: &str, channel_prefix: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(address)?;
        let publisher = client.get_multiplexed_async_connection().await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{channel_prefix}*")).await?;
        info!(channel_prefix, "redis pattern subscription established");

        let channels: Arc<RwLock<HashSet<String>>> = Arc::default();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let interest = Arc::clone(&channels);
        let reader = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_owned();
                if !interest.read().contains(&channel) {
                    continue;
                }
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel, error = %e, "non-string pubsub payload");
                        continue;
                    }
                };
                if tx.is_closed() {
                    return;
                }
                let _ = forward(&tx, ChannelMessage { channel, payload });
            }
            warn!("redis pubsub stream ended");
        });

        Ok(Self {
            publisher,
            channels,
            rx: Mutex::new(Some(rx)),
            reader,
        })
    }
}

impl Drop for RedisPubSub {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn subscribe(&self, channel: &str) -> Result<(), BackendError> {
        let _ = self.channels.write().insert(channel.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackendError> {
        let _ = self.channels.write().remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError> {
        let mut conn = self.publisher.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<ChannelMessage>> {
        self.rx.lock().take()
    }
}
