//! Connection Registry: owns every live, authenticated connection.
//!
//! Closing a connection removes it, signals its writer, and runs the
//! disconnect hook before [`ConnectionRegistry::close`] returns, so no job
//! subscription can outlive the connection it names.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use jobbridge_core::ConnectionId;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connection::{ClientConnection, CloseReason, EnqueueError, Outbound};
use crate::metrics::{
    WS_BACKPRESSURE_CLOSES_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

/// Invoked synchronously whenever a connection is destroyed.
pub trait DisconnectHook: Send + Sync {
    /// Detach `connection_id` from everything that references it.
    fn on_disconnect(&self, connection_id: &ConnectionId);
}

/// Outcome of a non-blocking delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Frame enqueued.
    Delivered,
    /// No such connection.
    Missing,
    /// Buffer full; the caller must close the connection.
    Overflow,
    /// Writer already gone.
    Closed,
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    hook: OnceLock<Weak<dyn DisconnectHook>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the disconnect hook. Only the first call has an effect.
    pub fn set_disconnect_hook(&self, hook: Weak<dyn DisconnectHook>) {
        if self.hook.set(hook).is_err() {
            warn!("disconnect hook already installed");
        }
    }

    /// Store an authenticated connection.
    pub fn register(&self, connection: Arc<ClientConnection>) {
        info!(conn_id = %connection.id, subject = %connection.identity().subject, "client connected");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        let _ = self.connections.insert(connection.id.clone(), connection);
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Whether the connection is still registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Enqueue pre-serialized text. Never closes the connection, so it is
    /// safe to call while holding locks the disconnect hook needs.
    pub fn deliver(&self, id: &ConnectionId, text: Arc<String>) -> Delivery {
        let Some(conn) = self.connections.get(id) else {
            return Delivery::Missing;
        };
        match conn.enqueue(Outbound::Text(text)) {
            Ok(()) => Delivery::Delivered,
            Err(EnqueueError::Full) => Delivery::Overflow,
            Err(EnqueueError::Closed) => Delivery::Closed,
        }
    }

    /// Serialize and enqueue a frame. A full buffer closes the connection
    /// with [`CloseReason::Backpressure`]. Returns `false` if the frame was
    /// not enqueued.
    pub fn send<T: Serialize>(&self, id: &ConnectionId, frame: &T) -> bool {
        let text = match serde_json::to_string(frame) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!(conn_id = %id, error = %e, "failed to serialize outbound frame");
                return false;
            }
        };
        self.send_text(id, text)
    }

    /// Enqueue pre-serialized text, closing the connection on overflow.
    pub fn send_text(&self, id: &ConnectionId, text: Arc<String>) -> bool {
        match self.deliver(id, text) {
            Delivery::Delivered => true,
            Delivery::Overflow => {
                let _ = self.close(id, CloseReason::Backpressure);
                false
            }
            Delivery::Missing | Delivery::Closed => false,
        }
    }

    /// Destroy a connection. Idempotent: only the first caller acts and gets
    /// `true`. The disconnect hook has run when this returns.
    pub fn close(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        let Some((_, conn)) = self.connections.remove(id) else {
            return false;
        };
        let _ = conn.mark_closed(reason.clone());

        if reason == CloseReason::Backpressure {
            warn!(conn_id = %id, dropped = conn.drop_count(), "closing slow consumer");
            counter!(WS_BACKPRESSURE_CLOSES_TOTAL).increment(1);
        }
        info!(conn_id = %id, reason = %reason, "client disconnected");
        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.label()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());

        match self.hook.get().and_then(Weak::upgrade) {
            Some(hook) => hook.on_disconnect(id),
            None => debug!(conn_id = %id, "no disconnect hook installed"),
        }
        true
    }

    /// Close every connection with [`CloseReason::ServerShutdown`].
    pub fn shutdown_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.close(id, CloseReason::ServerShutdown))
            .count()
    }
}
