//! Graceful shutdown: one `CancellationToken` shared by the HTTP listener,
//! background loops and sessions.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::websocket::registry::ConnectionRegistry;

/// Default time allowed for background tasks to drain.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates shutdown across server tasks.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Keep a background task so shutdown can wait for it.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Number of tracked background tasks.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the server:
    ///
    /// 1. Cancel the token (listener, router, sweeper and sessions see it)
    /// 2. Close every live connection with 1001
    /// 3. Wait up to `timeout` for tracked tasks, then abort the rest
    ///
    /// Returns the number of connections that were closed.
    pub async fn graceful_shutdown(&self, registry: &ConnectionRegistry, timeout: Duration) -> usize {
        self.shutdown();
        let closed = registry.shutdown_all();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        info!(
            connections = closed,
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "shutting down"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
        }
        closed
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("ctrl-c received"),
        () = terminate => info!("SIGTERM received"),
    }
}
