//! Correlation Table: which connections wait on which job, and under which
//! request id.
//!
//! Two sharded maps back the table: `jobs` (job id to subscription) and
//! `by_connection` (connection id to the jobs it waits on). Every mutation of
//! a job entry happens under that entry's shard write lock, and acks and
//! progress frames are enqueued while the lock is held, so a terminal frame
//! can never overtake them on the same connection. A guard from one map is
//! never held while locking the other, and no guard lives across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use indexmap::IndexMap;
use jobbridge_core::{ConnectionId, JobId};
use jobbridge_rpc::{ProgressFrame, ResultFrame, RpcError};
use metrics::{counter, gauge, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{
    JOB_COMPLETION_SECONDS, JOB_PROGRESS_DELIVERIES_TOTAL, JOB_SUBSCRIPTIONS_ACTIVE,
    JOB_TERMINAL_DELIVERIES_TOTAL, SWEEPS_TOTAL,
};
use crate::websocket::connection::CloseReason;
use crate::websocket::registry::{ConnectionRegistry, Delivery, DisconnectHook};

/// Subscription lifetimes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationConfig {
    /// Longest a subscription may wait for a terminal event.
    pub max_wait: Duration,
    /// How long an entry without members survives.
    pub abandoned_ttl: Duration,
    /// Prune entries as soon as their last member leaves.
    pub prune_abandoned_immediately: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(3600),
            abandoned_ttl: Duration::from_secs(60),
            prune_abandoned_immediately: false,
        }
    }
}

/// How [`CorrelationTable::subscribe`] treats a missing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Insert the entry if absent (job submission).
    Create,
    /// Join an existing entry only.
    Watch,
}

/// Successful subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscribed {
    /// `true` when no entry existed before this call. For
    /// [`SubscribeMode::Watch`] this means nothing was inserted.
    pub is_first_subscriber: bool,
}

/// Subscription failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The connection already waits on another job under this request id.
    #[error("Duplicate request id '{request_id}'")]
    DuplicateRequestId {
        /// The reused id.
        request_id: String,
    },
    /// The connection closed while subscribing.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<SubscribeError> for RpcError {
    fn from(err: SubscribeError) -> Self {
        match err {
            SubscribeError::DuplicateRequestId { .. } => Self::InvalidRequest {
                message: err.to_string(),
            },
            SubscribeError::ConnectionClosed => Self::Internal {
                message: err.to_string(),
            },
        }
    }
}

/// Lifecycle of a job entry. A pruned job has no entry at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Submission in flight.
    Created,
    /// Accepted by the queue, waiting for a terminal event.
    Active,
    /// Terminal frame being delivered (only seen on the removed value).
    Terminal,
    /// Every member left; kept until the TTL or a re-join.
    Abandoned,
}

#[derive(Clone, Debug)]
struct Member {
    request_id: String,
    joined: u64,
}

/// One job and the connections waiting on it.
#[derive(Debug)]
pub struct JobSubscription {
    job_id: JobId,
    members: IndexMap<ConnectionId, Member>,
    next_join: u64,
    created_at: Instant,
    state: JobState,
    last_progress_seq: Option<u64>,
    abandoned_at: Option<Instant>,
}

impl JobSubscription {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            members: IndexMap::new(),
            next_join: 0,
            created_at: Instant::now(),
            state: JobState::Created,
            last_progress_seq: None,
            abandoned_at: None,
        }
    }

    fn upsert_member(&mut self, connection_id: &ConnectionId, request_id: &str) {
        if let Some(member) = self.members.get_mut(connection_id) {
            request_id.clone_into(&mut member.request_id);
            return;
        }
        let joined = self.next_join;
        self.next_join += 1;
        let _ = self.members.insert(
            connection_id.clone(),
            Member {
                request_id: request_id.to_owned(),
                joined,
            },
        );
    }

    /// Removal swaps the last member into the hole; `joined` restores order.
    fn remove_member(&mut self, connection_id: &ConnectionId) -> bool {
        self.members.swap_remove(connection_id).is_some()
    }
}

/// An outcome reported for a job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobUpdate {
    /// Terminal success.
    Completed(Value),
    /// Terminal failure (worker error, submission failure, timeout).
    Failed(RpcError),
    /// Intermediate progress.
    Progress {
        /// Completion percentage.
        percent: f64,
        /// Human-readable status.
        message: String,
        /// Optional monotonically increasing sequence number. Only progress
        /// carrying one is de-duplicated.
        seq: Option<u64>,
    },
}

/// What [`CorrelationTable::resolve`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Entry removed; terminal frame sent to `delivered` members.
    Terminal {
        /// Frames enqueued.
        delivered: usize,
        /// Members whose connection was gone or overflowing.
        undeliverable: usize,
    },
    /// Progress sent to `delivered` members; entry kept.
    Progress {
        /// Frames enqueued.
        delivered: usize,
    },
    /// Terminal event for an abandoned entry: pruned with no delivery.
    PrunedAbandoned,
    /// Progress with an already-delivered sequence number.
    DuplicateProgress,
    /// No entry for the job.
    Dropped,
}

/// Result of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries force-resolved with a timeout error.
    pub timed_out: usize,
    /// Abandoned entries pruned after their TTL.
    pub abandoned_pruned: usize,
}

/// Job id to subscriber mapping.
pub struct CorrelationTable {
    jobs: DashMap<JobId, JobSubscription>,
    by_connection: DashMap<ConnectionId, HashMap<JobId, String>>,
    registry: Arc<ConnectionRegistry>,
    config: CorrelationConfig,
    pruned_tx: mpsc::UnboundedSender<JobId>,
}

impl CorrelationTable {
    /// Create a table and install it as the registry's disconnect hook.
    ///
    /// The receiver yields the id of every pruned job.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: CorrelationConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<JobId>) {
        let (pruned_tx, pruned_rx) = mpsc::unbounded_channel();
        let table = Arc::new(Self {
            jobs: DashMap::new(),
            by_connection: DashMap::new(),
            registry: Arc::clone(&registry),
            config,
            pruned_tx,
        });
        let hook: Arc<dyn DisconnectHook> = table.clone();
        registry.set_disconnect_hook(Arc::downgrade(&hook));
        (table, pruned_rx)
    }

    // ── Subscribe ───────────────────────────────────────────────────

    /// Add `connection_id` as a subscriber of `job_id` under `request_id`.
    ///
    /// `ack`, when given, is enqueued to the subscriber while the entry is
    /// locked, so it precedes every later frame for the job. Subscribing the
    /// same connection twice only updates its request id.
    pub fn subscribe(
        &self,
        job_id: &JobId,
        request_id: &str,
        connection_id: &ConnectionId,
        mode: SubscribeMode,
        ack: Option<Arc<String>>,
    ) -> Result<Subscribed, SubscribeError> {
        {
            let mut index = self.by_connection.entry(connection_id.clone()).or_default();
            if index
                .iter()
                .any(|(job, req)| req == request_id && job != job_id)
            {
                return Err(SubscribeError::DuplicateRequestId {
                    request_id: request_id.to_owned(),
                });
            }
            let _ = index.insert(job_id.clone(), request_id.to_owned());
        }

        let (is_first, delivery) = match self.jobs.entry(job_id.clone()) {
            Entry::Occupied(mut entry) => {
                let sub = entry.get_mut();
                sub.upsert_member(connection_id, request_id);
                if sub.state == JobState::Abandoned {
                    debug!(job_id = %job_id, conn_id = %connection_id, "abandoned job re-joined");
                    sub.state = JobState::Active;
                    sub.abandoned_at = None;
                }
                let delivery = ack.map(|text| self.registry.deliver(connection_id, text));
                (false, delivery)
            }
            Entry::Vacant(entry) => match mode {
                SubscribeMode::Create => {
                    let mut sub = JobSubscription::new(job_id.clone());
                    sub.upsert_member(connection_id, request_id);
                    let guard = entry.insert(sub);
                    gauge!(JOB_SUBSCRIPTIONS_ACTIVE).increment(1.0);
                    let delivery = ack.map(|text| self.registry.deliver(connection_id, text));
                    drop(guard);
                    (true, delivery)
                }
                SubscribeMode::Watch => {
                    drop(entry);
                    self.detach(connection_id, job_id);
                    return Ok(Subscribed {
                        is_first_subscriber: true,
                    });
                }
            },
        };

        if delivery == Some(Delivery::Overflow) {
            let _ = self.registry.close(connection_id, CloseReason::Backpressure);
        }
        if !self.registry.contains(connection_id) {
            let _ = self.remove_member(job_id, connection_id);
            self.detach(connection_id, job_id);
            return Err(SubscribeError::ConnectionClosed);
        }

        debug!(job_id = %job_id, conn_id = %connection_id, request_id, ?mode, is_first, "subscribed");
        Ok(Subscribed {
            is_first_subscriber: is_first,
        })
    }

    /// `Created -> Active` once the queue accepted the job. Returns `false`
    /// if the entry is gone or already past `Created`.
    pub fn activate(&self, job_id: &JobId) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(mut sub) if sub.state == JobState::Created => {
                sub.state = JobState::Active;
                true
            }
            _ => false,
        }
    }

    // ── Resolve ─────────────────────────────────────────────────────

    /// Apply an update for `job_id`.
    ///
    /// Terminal updates remove the entry and send each member a result frame
    /// carrying that member's own request id. Progress is sent to current
    /// members and keeps the entry. Updates for unknown jobs are dropped.
    pub fn resolve(&self, job_id: &JobId, update: JobUpdate) -> Resolution {
        match update {
            JobUpdate::Progress {
                percent,
                message,
                seq,
            } => self.resolve_progress(job_id, percent, message, seq),
            terminal => self.resolve_terminal(job_id, &terminal),
        }
    }

    fn resolve_terminal(&self, job_id: &JobId, update: &JobUpdate) -> Resolution {
        let Some((_, mut sub)) = self.jobs.remove(job_id) else {
            debug!(job_id = %job_id, "terminal event for unknown job dropped");
            return Resolution::Dropped;
        };
        let prior = sub.state;
        sub.state = JobState::Terminal;
        self.announce_pruned(&sub.job_id);

        if prior == JobState::Abandoned {
            debug!(job_id = %job_id, "abandoned job completed, nothing to deliver");
            return Resolution::PrunedAbandoned;
        }

        let mut delivered = 0;
        let mut undeliverable = 0;
        let mut overflowed = Vec::new();
        for (connection_id, member) in &sub.members {
            // The request id is free again before the member can see its result.
            self.detach(connection_id, job_id);
            let frame = match update {
                JobUpdate::Completed(result) => {
                    ResultFrame::success(member.request_id.clone(), job_id.clone(), result.clone())
                }
                JobUpdate::Failed(err) => ResultFrame::from_error(
                    Some(member.request_id.clone()),
                    Some(job_id.clone()),
                    err,
                ),
                JobUpdate::Progress { .. } => continue,
            };
            let text = match serde_json::to_string(&frame) {
                Ok(text) => Arc::new(text),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "failed to serialize result frame");
                    undeliverable += 1;
                    continue;
                }
            };
            match self.registry.deliver(connection_id, text) {
                Delivery::Delivered => delivered += 1,
                Delivery::Overflow => {
                    overflowed.push(connection_id.clone());
                    undeliverable += 1;
                }
                Delivery::Missing | Delivery::Closed => undeliverable += 1,
            }
        }

        for connection_id in &overflowed {
            let _ = self.registry.close(connection_id, CloseReason::Backpressure);
        }

        counter!(JOB_TERMINAL_DELIVERIES_TOTAL).increment(delivered as u64);
        histogram!(JOB_COMPLETION_SECONDS).record(sub.created_at.elapsed().as_secs_f64());
        debug!(job_id = %job_id, delivered, undeliverable, "job resolved");
        Resolution::Terminal {
            delivered,
            undeliverable,
        }
    }

    fn resolve_progress(
        &self,
        job_id: &JobId,
        percent: f64,
        message: String,
        seq: Option<u64>,
    ) -> Resolution {
        let mut overflowed = Vec::new();
        let delivered = {
            let Some(mut sub) = self.jobs.get_mut(job_id) else {
                debug!(job_id = %job_id, "progress for unknown job dropped");
                return Resolution::Dropped;
            };
            if let Some(seq) = seq {
                if sub.last_progress_seq.is_some_and(|last| seq <= last) {
                    debug!(job_id = %job_id, seq, "duplicate progress dropped");
                    return Resolution::DuplicateProgress;
                }
                sub.last_progress_seq = Some(seq);
            }
            if sub.members.is_empty() {
                return Resolution::Progress { delivered: 0 };
            }

            let frame = ProgressFrame::new(job_id.clone(), percent, message);
            let text = match serde_json::to_string(&frame) {
                Ok(text) => Arc::new(text),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "failed to serialize progress frame");
                    return Resolution::Dropped;
                }
            };
            let mut delivered = 0;
            for connection_id in sub.members.keys() {
                match self.registry.deliver(connection_id, Arc::clone(&text)) {
                    Delivery::Delivered => delivered += 1,
                    Delivery::Overflow => overflowed.push(connection_id.clone()),
                    Delivery::Missing | Delivery::Closed => {}
                }
            }
            delivered
        };

        for connection_id in &overflowed {
            let _ = self.registry.close(connection_id, CloseReason::Backpressure);
        }
        counter!(JOB_PROGRESS_DELIVERIES_TOTAL).increment(delivered as u64);
        Resolution::Progress { delivered }
    }

    // ── Unsubscribe ─────────────────────────────────────────────────

    /// Remove one subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, job_id: &JobId, connection_id: &ConnectionId) -> bool {
        let removed = self.remove_member(job_id, connection_id);
        self.detach(connection_id, job_id);
        removed
    }

    /// Detach a destroyed connection from every job it waited on.
    pub fn remove_connection(&self, connection_id: &ConnectionId) {
        let Some((_, jobs)) = self.by_connection.remove(connection_id) else {
            return;
        };
        for job_id in jobs.keys() {
            let _ = self.remove_member(job_id, connection_id);
        }
        debug!(conn_id = %connection_id, jobs = jobs.len(), "connection detached from jobs");
    }

    fn remove_member(&self, job_id: &JobId, connection_id: &ConnectionId) -> bool {
        let prune = {
            let Some(mut sub) = self.jobs.get_mut(job_id) else {
                return false;
            };
            if !sub.remove_member(connection_id) {
                return false;
            }
            if !sub.members.is_empty() {
                return true;
            }
            if self.config.prune_abandoned_immediately || sub.state == JobState::Created {
                true
            } else {
                sub.state = JobState::Abandoned;
                sub.abandoned_at = Some(Instant::now());
                debug!(job_id = %job_id, "job abandoned");
                false
            }
        };

        if prune {
            if let Some((pruned, _)) = self.jobs.remove_if(job_id, |_, sub| sub.members.is_empty()) {
                self.announce_pruned(&pruned);
            }
        }
        true
    }

    fn detach(&self, connection_id: &ConnectionId, job_id: &JobId) {
        if let Some(mut index) = self.by_connection.get_mut(connection_id) {
            let _ = index.remove(job_id);
        }
        let _ = self
            .by_connection
            .remove_if(connection_id, |_, index| index.is_empty());
    }

    fn announce_pruned(&self, job_id: &JobId) {
        gauge!(JOB_SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        // The router may already be gone during shutdown.
        let _ = self.pruned_tx.send(job_id.clone());
    }

    // ── Sweep ───────────────────────────────────────────────────────

    /// Time out overdue entries and prune expired abandoned ones.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut overdue = Vec::new();
        let mut expired = Vec::new();
        for entry in &self.jobs {
            let sub = entry.value();
            match sub.abandoned_at {
                Some(at) if sub.state == JobState::Abandoned => {
                    if now.saturating_duration_since(at) >= self.config.abandoned_ttl {
                        expired.push(sub.job_id.clone());
                    }
                }
                _ => {
                    if now.saturating_duration_since(sub.created_at) >= self.config.max_wait {
                        overdue.push(sub.job_id.clone());
                    }
                }
            }
        }

        let mut report = SweepReport::default();
        for job_id in overdue {
            let err = RpcError::Timeout {
                job_id: job_id.clone(),
                waited: self.config.max_wait,
            };
            if matches!(
                self.resolve(&job_id, JobUpdate::Failed(err)),
                Resolution::Terminal { .. } | Resolution::PrunedAbandoned
            ) {
                report.timed_out += 1;
            }
        }
        for job_id in expired {
            if let Some((pruned, _)) = self.jobs.remove_if(&job_id, |_, sub| {
                sub.state == JobState::Abandoned && sub.members.is_empty()
            }) {
                self.announce_pruned(&pruned);
                report.abandoned_pruned += 1;
            }
        }
        counter!(SWEEPS_TOTAL).increment(1);
        report
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(Instant::now());
                    if report != SweepReport::default() {
                        info!(timed_out = report.timed_out, abandoned_pruned = report.abandoned_pruned, "correlation sweep");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
        debug!("correlation sweeper stopped");
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Jobs a connection waits on, with the request id used for each.
    pub fn in_flight(&self, connection_id: &ConnectionId) -> Vec<(JobId, String)> {
        self.by_connection
            .get(connection_id)
            .map(|index| {
                index
                    .iter()
                    .map(|(job, req)| (job.clone(), req.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Members of a job in subscription order.
    pub fn members(&self, job_id: &JobId) -> Vec<(ConnectionId, String)> {
        self.jobs
            .get(job_id)
            .map(|sub| {
                let mut members: Vec<_> = sub.members.iter().collect();
                members.sort_unstable_by_key(|(_, m)| m.joined);
                members
                    .into_iter()
                    .map(|(conn, m)| (conn.clone(), m.request_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current state of a job entry.
    pub fn state(&self, job_id: &JobId) -> Option<JobState> {
        self.jobs.get(job_id).map(|sub| sub.state)
    }

    /// Whether an entry exists for the job.
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Number of job entries.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl DisconnectHook for CorrelationTable {
    fn on_disconnect(&self, connection_id: &ConnectionId) {
        self.remove_connection(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::websocket::connection::{ClientConnection, Outbound};
    use assert_matches::assert_matches;
    use jobbridge_rpc::errors::{SUBMISSION_FAILED, TIMEOUT_ERROR, UPSTREAM_ERROR};
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;
    use tokio::sync::mpsc::error::TryRecvError;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        table: Arc<CorrelationTable>,
        pruned: mpsc::UnboundedReceiver<JobId>,
    }

    fn harness(config: CorrelationConfig) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let (table, pruned) = CorrelationTable::new(Arc::clone(&registry), config);
        Harness {
            registry,
            table,
            pruned,
        }
    }

    fn connect(h: &Harness, capacity: usize) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = ClientConnection::with_buffer(Identity::anonymous("t"), capacity);
        h.registry.register(Arc::clone(&conn));
        (conn, rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn ack(text: &str) -> Option<Arc<String>> {
        Some(Arc::new(text.to_owned()))
    }

    fn job(id: &str) -> JobId {
        JobId::from(id)
    }

    // ── Subscribe ───────────────────────────────────────────────────

    #[test]
    fn create_inserts_entry_in_created_state() {
        let h = harness(CorrelationConfig::default());
        let (conn, _rx) = connect(&h, 8);
        let sub = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap();
        assert!(sub.is_first_subscriber);
        assert_eq!(h.table.state(&job("j1")), Some(JobState::Created));
        assert!(h.table.activate(&job("j1")));
        assert_eq!(h.table.state(&job("j1")), Some(JobState::Active));
        assert!(!h.table.activate(&job("j1")));
    }

    #[test]
    fn watch_of_unknown_job_inserts_nothing() {
        let h = harness(CorrelationConfig::default());
        let (conn, _rx) = connect(&h, 8);
        let sub = h
            .table
            .subscribe(&job("nope"), "r1", &conn.id, SubscribeMode::Watch, ack("a"))
            .unwrap();
        assert!(sub.is_first_subscriber);
        assert!(h.table.is_empty());
        assert!(h.table.in_flight(&conn.id).is_empty());
    }

    #[test]
    fn duplicate_request_id_rejected() {
        let h = harness(CorrelationConfig::default());
        let (conn, _rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap();
        let err = h
            .table
            .subscribe(&job("j2"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap_err();
        assert_matches!(err, SubscribeError::DuplicateRequestId { ref request_id } if request_id == "r1");
        assert!(!h.table.contains(&job("j2")));
        assert_eq!(RpcError::from(err).code(), -32_600);
    }

    #[test]
    fn resubscribe_updates_request_id() {
        let h = harness(CorrelationConfig::default());
        let (conn, _rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap();
        let again = h
            .table
            .subscribe(&job("j1"), "r2", &conn.id, SubscribeMode::Watch, None)
            .unwrap();
        assert!(!again.is_first_subscriber);
        assert_eq!(h.table.members(&job("j1")), vec![(conn.id.clone(), "r2".to_owned())]);
        assert_eq!(h.table.in_flight(&conn.id), vec![(job("j1"), "r2".to_owned())]);
    }

    #[test]
    fn subscribe_on_closed_connection_rolls_back() {
        let h = harness(CorrelationConfig::default());
        let (conn, _rx) = connect(&h, 8);
        let _ = h.registry.close(&conn.id, CloseReason::ClientClosed);
        let err = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap_err();
        assert_eq!(err, SubscribeError::ConnectionClosed);
        assert!(!h.table.contains(&job("j1")));
        assert!(h.table.in_flight(&conn.id).is_empty());
    }

    // ── Resolve ─────────────────────────────────────────────────────

    #[test]
    fn ack_precedes_result() {
        let h = harness(CorrelationConfig::default());
        let (conn, mut rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, ack(r#"{"ack":true}"#))
            .unwrap();
        let _ = h.table.resolve(&job("j1"), JobUpdate::Completed(json!(42)));

        assert_eq!(next_json(&mut rx)["ack"], true);
        let result = next_json(&mut rx);
        assert_eq!(result["result"], 42);
        assert_eq!(result["id"], "r1");
        assert_eq!(result["jobId"], "j1");
    }

    #[test]
    fn fan_out_uses_each_members_request_id() {
        let h = harness(CorrelationConfig::default());
        let (a, mut a_rx) = connect(&h, 8);
        let (b, mut b_rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("abc123"), "r1", &a.id, SubscribeMode::Create, None)
            .unwrap();
        let _ = h
            .table
            .subscribe(&job("abc123"), "r2", &b.id, SubscribeMode::Watch, None)
            .unwrap();

        let resolution = h.table.resolve(&job("abc123"), JobUpdate::Completed(json!({"ok": 1})));
        assert_eq!(
            resolution,
            Resolution::Terminal {
                delivered: 2,
                undeliverable: 0
            }
        );
        assert_eq!(next_json(&mut a_rx)["id"], "r1");
        assert_eq!(next_json(&mut b_rx)["id"], "r2");
        assert!(!h.table.contains(&job("abc123")));
        assert!(h.table.in_flight(&a.id).is_empty());
        assert!(h.table.in_flight(&b.id).is_empty());
    }

    #[test]
    fn terminal_delivered_at_most_once() {
        let h = harness(CorrelationConfig::default());
        let (conn, mut rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap();
        let _ = h.table.resolve(&job("j1"), JobUpdate::Completed(json!(1)));
        let late = h.table.resolve(&job("j1"), JobUpdate::Completed(json!(2)));
        assert_eq!(late, Resolution::Dropped);
        let _ = next_json(&mut rx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failure_forwards_error_body() {
        let h = harness(CorrelationConfig::default());
        let (conn, mut rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap();
        let err = RpcError::Upstream {
            code: UPSTREAM_ERROR,
            message: "worker crashed".into(),
            data: Some(json!({"attempt": 3})),
        };
        let _ = h.table.resolve(&job("j1"), JobUpdate::Failed(err));
        let frame = next_json(&mut rx);
        assert_eq!(frame["result"], Value::Null);
        assert_eq!(frame["error"]["code"], UPSTREAM_ERROR);
        assert_eq!(frame["error"]["message"], "worker crashed");
        assert_eq!(frame["error"]["data"]["attempt"], 3);
    }

    #[test]
    fn submission_failure_reaches_submitter() {
        let h = harness(CorrelationConfig::default());
        let (conn, mut rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap();
        let err = RpcError::SubmissionFailed {
            message: "queue down".into(),
        };
        assert_matches!(
            h.table.resolve(&job("j1"), JobUpdate::Failed(err)),
            Resolution::Terminal { delivered: 1, .. }
        );
        assert_eq!(next_json(&mut rx)["error"]["code"], SUBMISSION_FAILED);
    }

    #[test]
    fn progress_keeps_entry_and_dedupes_by_seq() {
        let h = harness(CorrelationConfig::default());
        let (conn, mut rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap();
        let progress = |seq| JobUpdate::Progress {
            percent: 50.0,
            message: "halfway".into(),
            seq: Some(seq),
        };

        assert_eq!(h.table.resolve(&job("j1"), progress(1)), Resolution::Progress { delivered: 1 });
        assert_eq!(h.table.resolve(&job("j1"), progress(1)), Resolution::DuplicateProgress);
        assert!(h.table.contains(&job("j1")));

        let frame = next_json(&mut rx);
        assert_eq!(frame["type"], "progress");
        assert_eq!(frame["percent"], 50.0);
        assert_eq!(frame["jobId"], "j1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn progress_without_seq_is_always_delivered() {
        let h = harness(CorrelationConfig::default());
        let (conn, mut rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &conn.id, SubscribeMode::Create, None)
            .unwrap();
        for _ in 0..2 {
            let update = JobUpdate::Progress {
                percent: 10.0,
                message: "again".into(),
                seq: None,
            };
            assert_eq!(h.table.resolve(&job("j1"), update), Resolution::Progress { delivered: 1 });
        }
        assert_eq!(next_json(&mut rx)["message"], "again");
        assert_eq!(next_json(&mut rx)["message"], "again");
    }

    #[test]
    fn progress_for_unknown_job_dropped() {
        let h = harness(CorrelationConfig::default());
        let update = JobUpdate::Progress {
            percent: 1.0,
            message: String::new(),
            seq: None,
        };
        assert_eq!(h.table.resolve(&job("gone"), update), Resolution::Dropped);
    }

    #[test]
    fn overflow_during_resolve_closes_connection() {
        let h = harness(CorrelationConfig::default());
        let (slow, _slow_rx) = connect(&h, 1);
        let (fast, mut fast_rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &slow.id, SubscribeMode::Create, ack("a"))
            .unwrap();
        let _ = h
            .table
            .subscribe(&job("j1"), "r2", &fast.id, SubscribeMode::Watch, None)
            .unwrap();

        let resolution = h.table.resolve(&job("j1"), JobUpdate::Completed(json!(true)));
        assert_eq!(
            resolution,
            Resolution::Terminal {
                delivered: 1,
                undeliverable: 1
            }
        );
        assert_eq!(slow.close_reason(), Some(&CloseReason::Backpressure));
        assert!(!h.registry.contains(&slow.id));
        assert_eq!(next_json(&mut fast_rx)["id"], "r2");
    }

    #[test]
    fn request_id_reusable_once_result_arrives() {
        let h = harness(CorrelationConfig::default());
        let (first, mut first_rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &first.id, SubscribeMode::Create, None)
            .unwrap();
        let mut watchers = Vec::new();
        for i in 0..5_000 {
            let (conn, rx) = connect(&h, 8);
            let _ = h
                .table
                .subscribe(&job("j1"), &format!("w{i}"), &conn.id, SubscribeMode::Watch, None)
                .unwrap();
            watchers.push((conn, rx));
        }

        let table = &h.table;
        thread::scope(|s| {
            let resolver = s.spawn(|| table.resolve(&job("j1"), JobUpdate::Completed(json!(1))));
            loop {
                match first_rx.try_recv() {
                    Ok(Outbound::Text(text)) => {
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        assert_eq!(frame["id"], "r1");
                        break;
                    }
                    Err(TryRecvError::Empty) => thread::yield_now(),
                    other => panic!("unexpected frame {other:?}"),
                }
            }
            // Fan-out to the other watchers may still be running here.
            let reused = table.subscribe(&job("j2"), "r1", &first.id, SubscribeMode::Create, None);
            assert_eq!(
                reused,
                Ok(Subscribed {
                    is_first_subscriber: true
                })
            );
            assert_matches!(
                resolver.join().unwrap(),
                Resolution::Terminal {
                    delivered: 5_001,
                    undeliverable: 0
                }
            );
        });
        assert_eq!(h.table.in_flight(&first.id), vec![(job("j2"), "r1".to_owned())]);
    }

    #[test]
    fn concurrent_watch_and_resolve_deliver_once() {
        for _ in 0..50 {
            let h = harness(CorrelationConfig::default());
            let (owner, _owner_rx) = connect(&h, 8);
            let _ = h
                .table
                .subscribe(&job("j1"), "r0", &owner.id, SubscribeMode::Create, None)
                .unwrap();
            assert!(h.table.activate(&job("j1")));
            let mut watchers: Vec<_> = (0..8).map(|_| connect(&h, 8)).collect();

            let barrier = Barrier::new(watchers.len() + 1);
            let table = &h.table;
            let joined: Vec<bool> = thread::scope(|s| {
                let handles: Vec<_> = watchers
                    .iter()
                    .enumerate()
                    .map(|(i, (conn, _))| {
                        let barrier = &barrier;
                        s.spawn(move || {
                            let _ = barrier.wait();
                            let sub = table
                                .subscribe(&job("j1"), &format!("w{i}"), &conn.id, SubscribeMode::Watch, None)
                                .unwrap();
                            !sub.is_first_subscriber
                        })
                    })
                    .collect();
                let resolver = s.spawn(|| {
                    let _ = barrier.wait();
                    table.resolve(&job("j1"), JobUpdate::Completed(json!("done")))
                });
                assert_matches!(resolver.join().unwrap(), Resolution::Terminal { .. });
                handles.into_iter().map(|handle| handle.join().unwrap()).collect()
            });

            for (i, ((conn, rx), joined)) in watchers.iter_mut().zip(joined).enumerate() {
                if joined {
                    assert_eq!(next_json(rx)["id"], format!("w{i}"));
                }
                assert_matches!(rx.try_recv(), Err(TryRecvError::Empty));
                assert!(h.table.in_flight(&conn.id).is_empty());
            }
            assert!(h.table.is_empty());
        }
    }

    // ── Membership ──────────────────────────────────────────────────

    #[test]
    fn members_keep_subscription_order_after_removals() {
        let h = harness(CorrelationConfig::default());
        let conns: Vec<_> = (0..5).map(|_| connect(&h, 8)).collect();
        for (i, (conn, _)) in conns.iter().enumerate() {
            let _ = h
                .table
                .subscribe(&job("j1"), &format!("r{i}"), &conn.id, SubscribeMode::Create, None)
                .unwrap();
        }
        assert!(h.table.unsubscribe(&job("j1"), &conns[1].0.id));
        let _ = h.registry.close(&conns[3].0.id, CloseReason::ClientClosed);

        let ids: Vec<String> = h.table.members(&job("j1")).into_iter().map(|(_, r)| r).collect();
        assert_eq!(ids, vec!["r0", "r2", "r4"]);
    }

    #[test]
    fn large_fan_out_membership() {
        let h = harness(CorrelationConfig::default());
        let mut conns = Vec::new();
        for i in 0..20_000 {
            let (conn, rx) = connect(&h, 4);
            let mode = if i == 0 {
                SubscribeMode::Create
            } else {
                SubscribeMode::Watch
            };
            let _ = h
                .table
                .subscribe(&job("big"), &format!("r{i}"), &conn.id, mode, None)
                .unwrap();
            conns.push((conn, rx));
        }
        assert!(h.table.activate(&job("big")));
        for (conn, _) in conns.iter().step_by(2) {
            let _ = h.registry.close(&conn.id, CloseReason::ClientClosed);
        }
        assert_eq!(h.table.members(&job("big")).len(), 10_000);

        assert_eq!(
            h.table.resolve(&job("big"), JobUpdate::Completed(json!(1))),
            Resolution::Terminal {
                delivered: 10_000,
                undeliverable: 0
            }
        );
        assert_eq!(next_json(&mut conns[1].1)["id"], "r1");
    }

    // ── Disconnect and abandonment ──────────────────────────────────

    #[test]
    fn disconnect_detaches_connection() {
        let mut h = harness(CorrelationConfig::default());
        let (a, _a_rx) = connect(&h, 8);
        let (b, _b_rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &a.id, SubscribeMode::Create, None)
            .unwrap();
        assert!(h.table.activate(&job("j1")));
        let _ = h
            .table
            .subscribe(&job("j1"), "r9", &b.id, SubscribeMode::Watch, None)
            .unwrap();

        let _ = h.registry.close(&a.id, CloseReason::HeartbeatTimeout);
        assert_eq!(h.table.members(&job("j1")), vec![(b.id.clone(), "r9".to_owned())]);
        assert!(h.table.in_flight(&a.id).is_empty());

        let _ = h.registry.close(&b.id, CloseReason::ClientClosed);
        assert_eq!(h.table.state(&job("j1")), Some(JobState::Abandoned));
        assert!(h.pruned.try_recv().is_err());
    }

    #[test]
    fn abandoned_entry_rejoined_becomes_active() {
        let h = harness(CorrelationConfig::default());
        let (a, _a_rx) = connect(&h, 8);
        let (b, mut b_rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &a.id, SubscribeMode::Create, None)
            .unwrap();
        let _ = h.table.activate(&job("j1"));
        let _ = h.registry.close(&a.id, CloseReason::ClientClosed);
        assert_eq!(h.table.state(&job("j1")), Some(JobState::Abandoned));

        let sub = h
            .table
            .subscribe(&job("j1"), "w1", &b.id, SubscribeMode::Watch, None)
            .unwrap();
        assert!(!sub.is_first_subscriber);
        assert_eq!(h.table.state(&job("j1")), Some(JobState::Active));

        let _ = h.table.resolve(&job("j1"), JobUpdate::Completed(json!("done")));
        assert_eq!(next_json(&mut b_rx)["id"], "w1");
    }

    #[test]
    fn abandoned_entry_completes_without_delivery() {
        let mut h = harness(CorrelationConfig::default());
        let (a, _a_rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &a.id, SubscribeMode::Create, None)
            .unwrap();
        let _ = h.table.activate(&job("j1"));
        assert!(h.table.unsubscribe(&job("j1"), &a.id));

        let resolution = h.table.resolve(&job("j1"), JobUpdate::Completed(json!(1)));
        assert_eq!(resolution, Resolution::PrunedAbandoned);
        assert_eq!(h.pruned.try_recv().unwrap(), job("j1"));
    }

    #[test]
    fn immediate_prune_when_configured() {
        let mut h = harness(CorrelationConfig {
            prune_abandoned_immediately: true,
            ..CorrelationConfig::default()
        });
        let (a, _a_rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &a.id, SubscribeMode::Create, None)
            .unwrap();
        let _ = h.table.activate(&job("j1"));
        assert!(h.table.unsubscribe(&job("j1"), &a.id));
        assert!(!h.table.contains(&job("j1")));
        assert_eq!(h.pruned.try_recv().unwrap(), job("j1"));
    }

    #[test]
    fn never_submitted_entry_pruned_when_emptied() {
        let mut h = harness(CorrelationConfig::default());
        let (a, _a_rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &a.id, SubscribeMode::Create, None)
            .unwrap();
        let _ = h.registry.close(&a.id, CloseReason::ClientClosed);
        assert!(!h.table.contains(&job("j1")));
        assert_eq!(h.pruned.try_recv().unwrap(), job("j1"));
    }

    #[test]
    fn unsubscribe_unknown_member_is_noop() {
        let h = harness(CorrelationConfig::default());
        let (a, _a_rx) = connect(&h, 8);
        assert!(!h.table.unsubscribe(&job("j1"), &a.id));
    }

    // ── Sweep ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn sweep_times_out_overdue_jobs() {
        let h = harness(CorrelationConfig {
            max_wait: Duration::from_secs(60),
            ..CorrelationConfig::default()
        });
        let (a, mut rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &a.id, SubscribeMode::Create, None)
            .unwrap();
        let _ = h.table.activate(&job("j1"));

        assert_eq!(h.table.sweep(Instant::now()), SweepReport::default());
        time::advance(Duration::from_secs(61)).await;
        let report = h.table.sweep(Instant::now());

        assert_eq!(report.timed_out, 1);
        let frame = next_json(&mut rx);
        assert_eq!(frame["error"]["code"], TIMEOUT_ERROR);
        assert_eq!(frame["id"], "r1");
        assert!(h.table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_prunes_expired_abandoned_entries() {
        let mut h = harness(CorrelationConfig {
            abandoned_ttl: Duration::from_secs(60),
            ..CorrelationConfig::default()
        });
        let (a, _rx) = connect(&h, 8);
        let _ = h
            .table
            .subscribe(&job("j1"), "r1", &a.id, SubscribeMode::Create, None)
            .unwrap();
        let _ = h.table.activate(&job("j1"));
        let _ = h.table.unsubscribe(&job("j1"), &a.id);

        time::advance(Duration::from_secs(30)).await;
        assert_eq!(h.table.sweep(Instant::now()).abandoned_pruned, 0);
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(h.table.sweep(Instant::now()).abandoned_pruned, 1);
        assert!(h.table.is_empty());
        assert_eq!(h.pruned.try_recv().unwrap(), job("j1"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let h = harness(CorrelationConfig::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            Arc::clone(&h.table).run_sweeper(Duration::from_secs(5), cancel.clone()),
        );
        time::advance(Duration::from_secs(12)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
