//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Connections closed for overflowing their outbound buffer (counter).
pub const WS_BACKPRESSURE_CLOSES_TOTAL: &str = "ws_backpressure_closes_total";
/// Connections closed by the heartbeat monitor (counter).
pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "ws_heartbeat_timeouts_total";
/// Upgrade attempts rejected during authentication (counter, labels: reason).
pub const WS_AUTH_FAILURES_TOTAL: &str = "ws_auth_failures_total";
/// Inbound RPC frames (counter).
pub const RPC_FRAMES_TOTAL: &str = "rpc_frames_total";
/// RPC error replies (counter, labels: code).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// Jobs handed to the queue (counter, labels: method).
pub const JOBS_SUBMITTED_TOTAL: &str = "jobs_submitted_total";
/// Jobs the queue refused (counter).
pub const JOBS_SUBMIT_FAILURES_TOTAL: &str = "jobs_submit_failures_total";
/// Live job subscriptions (gauge).
pub const JOB_SUBSCRIPTIONS_ACTIVE: &str = "job_subscriptions_active";
/// Terminal frames delivered to subscribers (counter).
pub const JOB_TERMINAL_DELIVERIES_TOTAL: &str = "job_terminal_deliveries_total";
/// Progress frames delivered to subscribers (counter).
pub const JOB_PROGRESS_DELIVERIES_TOTAL: &str = "job_progress_deliveries_total";
/// Submission-to-terminal latency seconds (histogram).
pub const JOB_COMPLETION_SECONDS: &str = "job_completion_seconds";
/// External events dropped (counter, labels: reason).
pub const EVENTS_DROPPED_TOTAL: &str = "events_dropped_total";
/// Correlation sweeps run (counter).
pub const SWEEPS_TOTAL: &str = "correlation_sweeps_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_BACKPRESSURE_CLOSES_TOTAL,
            WS_HEARTBEAT_TIMEOUTS_TOTAL,
            WS_AUTH_FAILURES_TOTAL,
            RPC_FRAMES_TOTAL,
            RPC_ERRORS_TOTAL,
            JOBS_SUBMITTED_TOTAL,
            JOBS_SUBMIT_FAILURES_TOTAL,
            JOB_SUBSCRIPTIONS_ACTIVE,
            JOB_TERMINAL_DELIVERIES_TOTAL,
            JOB_PROGRESS_DELIVERIES_TOTAL,
            JOB_COMPLETION_SECONDS,
            EVENTS_DROPPED_TOTAL,
            SWEEPS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
