//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"draining"` once shutdown has started.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
    /// Job subscriptions still waiting for a terminal event.
    pub active_jobs: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    active_jobs: usize,
    draining: bool,
) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_jobs,
    }
}
