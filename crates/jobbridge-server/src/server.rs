//! `GatewayServer`: Axum HTTP + WebSocket server wiring the registry,
//! correlation table, notification router and protocol handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use jobbridge_core::JobId;
use jobbridge_rpc::MethodRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{TokenValidator, bearer_from_headers};
use crate::backend::{JobSubmitter, PubSub};
use crate::config::ServerConfig;
use crate::correlation::CorrelationTable;
use crate::health::{self, HealthResponse};
use crate::protocol::ProtocolHandler;
use crate::router::NotificationRouter;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::heartbeat::HeartbeatMonitor;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{SessionContext, run_ws_session};

/// Server start-up failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried.
        addr: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// Socket error after binding.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
    /// `listen` was called twice on the same server.
    #[error("server already started")]
    AlreadyStarted,
}

/// External collaborators the gateway talks to.
#[derive(Clone)]
pub struct Backends {
    /// Durable job queue.
    pub submitter: Arc<dyn JobSubmitter>,
    /// Per-job event channels.
    pub pubsub: Arc<dyn PubSub>,
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    session: Arc<SessionContext>,
    table: Arc<CorrelationTable>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    max_connections: usize,
    max_message_size: usize,
    metrics: Option<PrometheusHandle>,
}

/// The job-notification gateway.
pub struct GatewayServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    table: Arc<CorrelationTable>,
    notifications: Arc<NotificationRouter>,
    session: Arc<SessionContext>,
    shutdown: Arc<ShutdownCoordinator>,
    pruned_rx: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Wire every component. Nothing runs until [`GatewayServer::listen`].
    pub fn new(
        config: ServerConfig,
        methods: MethodRegistry,
        validator: TokenValidator,
        backends: Backends,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (table, pruned_rx) =
            CorrelationTable::new(Arc::clone(&registry), config.correlation.clone());
        let notifications = Arc::new(NotificationRouter::new(
            backends.pubsub,
            Arc::clone(&table),
            config.channel_prefix.clone(),
        ));
        let protocol = ProtocolHandler::new(
            methods,
            Arc::clone(&table),
            Arc::clone(&notifications),
            backends.submitter,
            Arc::clone(&registry),
        )
        .with_malformed_limit(config.malformed_frame_limit, config.malformed_frame_window);
        let shutdown = Arc::new(ShutdownCoordinator::new());

        let session = Arc::new(SessionContext {
            registry: Arc::clone(&registry),
            protocol: Arc::new(protocol),
            validator: Arc::new(validator),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval, config.heartbeat_grace),
            handshake_timeout: config.handshake_timeout,
            outbound_buffer_frames: config.outbound_buffer_frames,
            shutdown: shutdown.token(),
        });

        Self {
            config,
            registry,
            table,
            notifications,
            session,
            shutdown,
            pruned_rx: Mutex::new(Some(pruned_rx)),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            session: Arc::clone(&self.session),
            table: Arc::clone(&self.table),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            max_connections: self.config.max_connections,
            max_message_size: self.config.max_message_size,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind, start the background loops and serve until shutdown.
    pub async fn listen(&self) -> Result<ServerHandle, ServerError> {
        let pruned_rx = self.pruned_rx.lock().take().ok_or(ServerError::AlreadyStarted)?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let token = self.shutdown.token();
        self.shutdown.track(tokio::spawn(
            Arc::clone(&self.notifications).run(pruned_rx, token.clone()),
        ));
        self.shutdown.track(tokio::spawn(
            Arc::clone(&self.table).run_sweeper(self.config.sweep_interval, token.clone()),
        ));

        let app = self.router();
        self.shutdown.track(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        }));

        info!(%local_addr, "gateway listening");
        Ok(ServerHandle {
            local_addr,
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
        })
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Job subscriptions.
    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token cancelled when shutdown starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Close every connection and wait up to `timeout` for background tasks.
    pub async fn shutdown(self, timeout: Duration) -> usize {
        self.shutdown.graceful_shutdown(&self.registry, timeout).await
    }
}

/// Query string accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.session.registry.connection_count(),
        state.table.len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

/// GET /ws
///
/// The credential may come from `Authorization: Bearer` or `?token=`;
/// without either the client must send an `auth` frame first.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    if state.session.registry.connection_count() >= state.max_connections {
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let pre_token = bearer_from_headers(&headers)
        .map(str::to_owned)
        .or(query.token);
    let ctx = Arc::clone(&state.session);
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, pre_token, ctx))
}
