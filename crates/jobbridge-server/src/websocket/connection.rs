//! WebSocket client connection state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::close_code;
use jobbridge_core::ConnectionId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::Identity;

/// A frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON text frame.
    Text(Arc<String>),
    /// WebSocket protocol ping.
    Ping,
}

/// Why a connection was destroyed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the socket or the stream ended.
    ClientClosed,
    /// No liveness acknowledgment within the heartbeat grace period.
    HeartbeatTimeout,
    /// The outbound buffer overflowed.
    Backpressure,
    /// Too many malformed frames.
    MalformedFrames,
    /// The server is shutting down.
    ServerShutdown,
    /// Reading from the socket failed.
    TransportError,
}

impl CloseReason {
    /// WebSocket close code sent with the Close frame.
    pub fn code(&self) -> u16 {
        match self {
            Self::ClientClosed => close_code::NORMAL,
            Self::HeartbeatTimeout | Self::ServerShutdown => close_code::AWAY,
            Self::Backpressure => close_code::AGAIN,
            Self::MalformedFrames => close_code::POLICY,
            Self::TransportError => close_code::ERROR,
        }
    }

    /// Reason string sent with the Close frame.
    pub fn message(&self) -> &'static str {
        match self {
            Self::ClientClosed => "closed",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::Backpressure => "backpressure",
            Self::MalformedFrames => "too many malformed frames",
            Self::ServerShutdown => "server shutting down",
            Self::TransportError => "transport error",
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Backpressure => "backpressure",
            Self::MalformedFrames => "malformed_frames",
            Self::ServerShutdown => "server_shutdown",
            Self::TransportError => "transport_error",
        }
    }

    /// Whether the server should send its own Close frame. When the client
    /// closed or the transport failed there is nobody left to tell.
    pub fn sends_close_frame(&self) -> bool {
        !matches!(self, Self::ClientClosed | Self::TransportError)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Failure to enqueue an outbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The outbound buffer is full.
    Full,
    /// The writer task is gone.
    Closed,
}

struct MalformedWindow {
    started: Instant,
    count: u32,
}

/// Represents an authenticated WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    identity: Identity,
    tx: mpsc::Sender<Outbound>,
    /// When this connection was established.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_frames: AtomicU64,
    close_token: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    malformed: Mutex<MalformedWindow>,
}

impl ClientConnection {
    /// Create a new connection writing into `tx`.
    pub fn new(id: ConnectionId, identity: Identity, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
            close_token: CancellationToken::new(),
            close_reason: OnceLock::new(),
            malformed: Mutex::new(MalformedWindow {
                started: now,
                count: 0,
            }),
        }
    }

    /// Create a connection with its own bounded outbound channel.
    pub fn with_buffer(
        identity: Identity,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(ConnectionId::new(), identity, tx)), rx)
    }

    /// Authenticated identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Enqueue a frame without waiting.
    pub fn enqueue(&self, frame: Outbound) -> Result<(), EnqueueError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Total frames dropped because the buffer was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Record liveness (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Clear the alive flag before a heartbeat probe.
    pub fn clear_alive(&self) {
        self.is_alive.store(false, Ordering::Relaxed);
    }

    /// Whether liveness was recorded since the last [`clear_alive`](Self::clear_alive).
    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    /// Time since the last inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Token cancelled when the connection is closed.
    pub fn close_token(&self) -> CancellationToken {
        self.close_token.clone()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// Record the close reason and signal the writer. The first reason wins;
    /// returns `false` if the connection was already closed.
    pub fn mark_closed(&self, reason: CloseReason) -> bool {
        let first = self.close_reason.set(reason).is_ok();
        self.close_token.cancel();
        first
    }

    /// The recorded close reason, once closed.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.get()
    }

    /// Count a malformed frame. Returns `true` once more than `limit`
    /// malformed frames arrived within `window`.
    pub fn record_malformed(&self, limit: u32, window: Duration) -> bool {
        let mut w = self.malformed.lock();
        if w.started.elapsed() > window {
            w.started = Instant::now();
            w.count = 0;
        }
        w.count = w.count.saturating_add(1);
        w.count > limit
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("subject", &self.identity.subject)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
