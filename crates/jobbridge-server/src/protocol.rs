//! RPC Protocol Handler: validates inbound frames and decides between
//! submitting a job, watching one, and the control methods.

use std::sync::Arc;
use std::time::Duration;

use jobbridge_core::JobId;
use jobbridge_rpc::{
    AckFrame, Capability, FrameError, JobMethod, MethodRegistry, ResultFrame, RpcError,
    RpcRequest, parse_request,
};
use metrics::counter;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendError, JobSubmitter};
use crate::correlation::{CorrelationTable, JobUpdate, SubscribeError, SubscribeMode, Subscribed};
use crate::metrics::{JOBS_SUBMIT_FAILURES_TOTAL, JOBS_SUBMITTED_TOTAL, RPC_ERRORS_TOTAL, RPC_FRAMES_TOTAL};
use crate::router::NotificationRouter;
use crate::websocket::connection::{ClientConnection, CloseReason};
use crate::websocket::registry::ConnectionRegistry;

/// Handles every text frame of an authenticated connection.
pub struct ProtocolHandler {
    methods: MethodRegistry,
    table: Arc<CorrelationTable>,
    router: Arc<NotificationRouter>,
    submitter: Arc<dyn JobSubmitter>,
    registry: Arc<ConnectionRegistry>,
    malformed_limit: u32,
    malformed_window: Duration,
}

impl ProtocolHandler {
    /// Create a handler with the default malformed-frame policy (20 per
    /// minute).
    pub fn new(
        methods: MethodRegistry,
        table: Arc<CorrelationTable>,
        router: Arc<NotificationRouter>,
        submitter: Arc<dyn JobSubmitter>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            methods,
            table,
            router,
            submitter,
            registry,
            malformed_limit: 20,
            malformed_window: Duration::from_secs(60),
        }
    }

    /// Close connections sending more than `limit` malformed frames per `window`.
    #[must_use]
    pub fn with_malformed_limit(mut self, limit: u32, window: Duration) -> Self {
        self.malformed_limit = limit;
        self.malformed_window = window;
        self
    }

    /// Validate and dispatch one text frame.
    #[instrument(skip_all, fields(conn_id = %conn.id, method, request_id))]
    pub async fn handle_frame(&self, conn: &Arc<ClientConnection>, text: &str) {
        counter!(RPC_FRAMES_TOTAL).increment(1);

        let request = match parse_request(text) {
            Ok(request) => request,
            Err(frame_err) => {
                self.reject(conn, frame_err);
                return;
            }
        };

        let span = tracing::Span::current();
        let _ = span.record("method", request.method.as_str());
        let _ = span.record("request_id", request.id.as_str());
        debug!(job_id = ?request.job_id, "dispatching frame");

        let capability = match self.methods.resolve(&request.method) {
            Ok(capability) => capability,
            Err(err) => {
                self.reply_error(conn, Some(request.id), request.job_id, &err);
                return;
            }
        };

        match capability {
            Capability::Ping => {
                self.reply(conn, &ResultFrame::reply(request.id, None, json!({"pong": true})));
            }
            Capability::Watch => match request.job_id.clone() {
                Some(job_id) => self.watch(conn, &request.id, job_id),
                None => self.require_job_id(conn, request),
            },
            Capability::Unwatch => match request.job_id.clone() {
                Some(job_id) => {
                    let unwatched = self.table.unsubscribe(&job_id, &conn.id);
                    debug!(job_id = %job_id, unwatched, "unwatch");
                    self.reply(
                        conn,
                        &ResultFrame::reply(request.id, Some(job_id), json!({"unwatched": unwatched})),
                    );
                }
                None => self.require_job_id(conn, request),
            },
            Capability::Cancel => match request.job_id.clone() {
                Some(job_id) => self.cancel(conn, request.id, job_id).await,
                None => self.require_job_id(conn, request),
            },
            Capability::Job(handler) => match request.job_id.clone() {
                Some(job_id) => self.watch(conn, &request.id, job_id),
                None => self.submit(conn, request, handler.as_ref()).await,
            },
        }
    }

    /// Reject a binary frame that is not valid UTF-8.
    pub fn reject_binary(&self, conn: &Arc<ClientConnection>) {
        counter!(RPC_FRAMES_TOTAL).increment(1);
        self.reject(
            conn,
            FrameError {
                id: None,
                job_id: None,
                error: RpcError::Parse {
                    message: "binary frame is not valid UTF-8".into(),
                },
            },
        );
    }

    fn reject(&self, conn: &Arc<ClientConnection>, frame_err: FrameError) {
        self.reply_error(conn, frame_err.id, frame_err.job_id, &frame_err.error);
        if conn.record_malformed(self.malformed_limit, self.malformed_window) {
            warn!(conn_id = %conn.id, "malformed frame limit exceeded");
            let _ = self.registry.close(&conn.id, CloseReason::MalformedFrames);
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────

    async fn submit(&self, conn: &Arc<ClientConnection>, request: RpcRequest, handler: &dyn JobMethod) {
        if let Err(err) = handler.validate(&request.params) {
            self.reply_error(conn, Some(request.id), None, &err);
            return;
        }

        let job_id = JobId::new();
        let ack = ack_text(&job_id, &request.id);
        match self
            .table
            .subscribe(&job_id, &request.id, &conn.id, SubscribeMode::Create, ack)
        {
            Ok(_) => {}
            Err(SubscribeError::ConnectionClosed) => return,
            Err(err) => {
                self.reply_error(conn, Some(request.id), None, &err.into());
                return;
            }
        }

        if let Err(e) = self.router.watch_channel(&job_id).await {
            warn!(job_id = %job_id, error = %e, "cannot subscribe job channel, job not submitted");
            let err = RpcError::NotAvailable {
                message: "Notification channel unavailable".into(),
            };
            let _ = self.table.resolve(&job_id, JobUpdate::Failed(err));
            return;
        }
        if !self.table.contains(&job_id) {
            debug!(job_id = %job_id, "submitter left before submission, job dropped");
            return;
        }

        match self.submitter.submit(&request.method, &request.params, &job_id).await {
            Ok(()) => {
                let _ = self.table.activate(&job_id);
                counter!(JOBS_SUBMITTED_TOTAL, "method" => request.method.clone()).increment(1);
                info!(job_id = %job_id, "job submitted");
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "job submission failed");
                counter!(JOBS_SUBMIT_FAILURES_TOTAL).increment(1);
                let err = RpcError::SubmissionFailed {
                    message: e.to_string(),
                };
                let _ = self.table.resolve(&job_id, JobUpdate::Failed(err));
            }
        }
    }

    fn watch(&self, conn: &Arc<ClientConnection>, request_id: &str, job_id: JobId) {
        let ack = ack_text(&job_id, request_id);
        match self
            .table
            .subscribe(&job_id, request_id, &conn.id, SubscribeMode::Watch, ack)
        {
            Ok(Subscribed {
                is_first_subscriber: true,
            }) => {
                let err = RpcError::JobNotFound {
                    job_id: job_id.clone(),
                };
                self.reply_error(conn, Some(request_id.to_owned()), Some(job_id), &err);
            }
            Ok(_) => debug!(job_id = %job_id, "watching job"),
            Err(SubscribeError::ConnectionClosed) => {}
            Err(err) => {
                self.reply_error(conn, Some(request_id.to_owned()), Some(job_id), &err.into());
            }
        }
    }

    async fn cancel(&self, conn: &Arc<ClientConnection>, request_id: String, job_id: JobId) {
        let requested = match self.submitter.cancel(&job_id).await {
            Ok(()) => {
                info!(job_id = %job_id, "cancellation requested");
                true
            }
            Err(BackendError::Unsupported(_)) => {
                debug!(job_id = %job_id, "backend does not support cancellation");
                false
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cancellation request failed");
                false
            }
        };
        self.reply(
            conn,
            &ResultFrame::reply(request_id, Some(job_id), json!({"cancelRequested": requested})),
        );
    }

    fn require_job_id(&self, conn: &Arc<ClientConnection>, request: RpcRequest) {
        let err = RpcError::InvalidRequest {
            message: format!("'{}' requires jobId", request.method),
        };
        self.reply_error(conn, Some(request.id), None, &err);
    }

    // ── Replies ─────────────────────────────────────────────────────

    fn reply(&self, conn: &Arc<ClientConnection>, frame: &ResultFrame) {
        let _ = self.registry.send(&conn.id, frame);
    }

    fn reply_error(
        &self,
        conn: &Arc<ClientConnection>,
        id: Option<String>,
        job_id: Option<JobId>,
        err: &RpcError,
    ) {
        counter!(RPC_ERRORS_TOTAL, "code" => err.code().to_string()).increment(1);
        debug!(code = err.code(), error = %err, "rpc error reply");
        self.reply(conn, &ResultFrame::from_error(id, job_id, err));
    }
}

fn ack_text(job_id: &JobId, request_id: &str) -> Option<Arc<String>> {
    match serde_json::to_string(&AckFrame::new(job_id.clone(), request_id)) {
        Ok(text) => Some(Arc::new(text)),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to serialize ack");
            None
        }
    }
}
