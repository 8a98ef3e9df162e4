// SPDX-License-Identifier: MIT
//! In-process performance counters exposed as `GET /metrics` in Prometheus
//! text format, multiplexed on the same port as the WebSocket listener.
//!
//! No external metrics library — all counters are `AtomicU64` incremented
//! inline at the call site.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Pid, System};

/// In-process performance counters shared across all connections.
#[derive(Debug)]
pub struct OcppMetrics {
    /// Total WebSocket connections accepted since start.
    pub connections_accepted: AtomicU64,
    /// Connections rejected during the upgrade/handshake pipeline (auth,
    /// subprotocol mismatch, TLS failure).
    pub connections_rejected: AtomicU64,
    /// Total CALL frames sent (as the calling side) since start.
    pub calls_sent: AtomicU64,
    /// Total CALL frames received (as the called side) since start.
    pub calls_received: AtomicU64,
    /// Total CALLRESULT frames sent since start.
    pub call_results_sent: AtomicU64,
    /// Total CALLERROR frames sent since start.
    pub call_errors_sent: AtomicU64,
    /// Outbound calls that timed out waiting for a response.
    pub call_timeouts: AtomicU64,
    /// Calls rejected because the outbound queue was full.
    pub queue_full_rejections: AtomicU64,
    /// Rate limiter rejections (global + per-method combined).
    pub rate_limit_hits: AtomicU64,
    /// Frames dropped for failing JSON Schema validation.
    pub validation_failures: AtomicU64,
    /// Malformed frames that did not parse as a wire message at all.
    pub malformed_frames: AtomicU64,
    /// Client reconnect attempts made since start.
    pub reconnect_attempts: AtomicU64,
    /// Circuit breaker open-transitions observed since start.
    pub circuit_breaker_trips: AtomicU64,
    /// Liveness pings sent since start.
    pub pings_sent: AtomicU64,
    /// Connections forcibly closed for not returning a pong in time.
    pub pong_timeouts: AtomicU64,
    /// Process start time — used to compute uptime in the rendered output.
    pub started_at: Instant,
}

impl OcppMetrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            calls_sent: AtomicU64::new(0),
            calls_received: AtomicU64::new(0),
            call_results_sent: AtomicU64::new(0),
            call_errors_sent: AtomicU64::new(0),
            call_timeouts: AtomicU64::new(0),
            queue_full_rejections: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            pong_timeouts: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_calls_sent(&self) {
        self.calls_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_calls_received(&self) {
        self.calls_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_call_results_sent(&self) {
        self.call_results_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_call_errors_sent(&self) {
        self.call_errors_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_call_timeouts(&self) {
        self.call_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_full_rejections(&self) {
        self.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limit_hits(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_validation_failures(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed_frames(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_circuit_breaker_trips(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pings_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pong_timeouts(&self) {
        self.pong_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Render counters in Prometheus text format.
    ///
    /// `active_sessions` and `ws_buffered_bytes` are passed in because they
    /// require a lock over the session registry and aren't stored on this
    /// struct.
    pub fn render_prometheus(&self, active_sessions: u64, ws_buffered_bytes: u64) -> String {
        let uptime = self.started_at.elapsed().as_secs();
        let rss_bytes = current_process_rss_bytes();
        let connections_accepted = self.connections_accepted.load(Ordering::Relaxed);
        let connections_rejected = self.connections_rejected.load(Ordering::Relaxed);
        let calls_sent = self.calls_sent.load(Ordering::Relaxed);
        let calls_received = self.calls_received.load(Ordering::Relaxed);
        let call_results_sent = self.call_results_sent.load(Ordering::Relaxed);
        let call_errors_sent = self.call_errors_sent.load(Ordering::Relaxed);
        let call_timeouts = self.call_timeouts.load(Ordering::Relaxed);
        let queue_full_rejections = self.queue_full_rejections.load(Ordering::Relaxed);
        let rate_limit_hits = self.rate_limit_hits.load(Ordering::Relaxed);
        let validation_failures = self.validation_failures.load(Ordering::Relaxed);
        let malformed_frames = self.malformed_frames.load(Ordering::Relaxed);
        let reconnect_attempts = self.reconnect_attempts.load(Ordering::Relaxed);
        let circuit_breaker_trips = self.circuit_breaker_trips.load(Ordering::Relaxed);
        let pings_sent = self.pings_sent.load(Ordering::Relaxed);
        let pong_timeouts = self.pong_timeouts.load(Ordering::Relaxed);

        format!(
            "# HELP ocppjd_uptime_seconds Process uptime in seconds.\n\
             # TYPE ocppjd_uptime_seconds gauge\n\
             ocppjd_uptime_seconds {uptime}\n\
             # HELP ocppjd_active_sessions Current number of active sessions.\n\
             # TYPE ocppjd_active_sessions gauge\n\
             ocppjd_active_sessions {active_sessions}\n\
             # HELP ocppjd_connections_accepted_total WebSocket connections accepted since start.\n\
             # TYPE ocppjd_connections_accepted_total counter\n\
             ocppjd_connections_accepted_total {connections_accepted}\n\
             # HELP ocppjd_connections_rejected_total WebSocket connections rejected during upgrade/handshake.\n\
             # TYPE ocppjd_connections_rejected_total counter\n\
             ocppjd_connections_rejected_total {connections_rejected}\n\
             # HELP ocppjd_calls_sent_total CALL frames sent since start.\n\
             # TYPE ocppjd_calls_sent_total counter\n\
             ocppjd_calls_sent_total {calls_sent}\n\
             # HELP ocppjd_calls_received_total CALL frames received since start.\n\
             # TYPE ocppjd_calls_received_total counter\n\
             ocppjd_calls_received_total {calls_received}\n\
             # HELP ocppjd_call_results_sent_total CALLRESULT frames sent since start.\n\
             # TYPE ocppjd_call_results_sent_total counter\n\
             ocppjd_call_results_sent_total {call_results_sent}\n\
             # HELP ocppjd_call_errors_sent_total CALLERROR frames sent since start.\n\
             # TYPE ocppjd_call_errors_sent_total counter\n\
             ocppjd_call_errors_sent_total {call_errors_sent}\n\
             # HELP ocppjd_call_timeouts_total Outbound calls that timed out waiting for a response.\n\
             # TYPE ocppjd_call_timeouts_total counter\n\
             ocppjd_call_timeouts_total {call_timeouts}\n\
             # HELP ocppjd_queue_full_rejections_total Calls rejected because the outbound queue was full.\n\
             # TYPE ocppjd_queue_full_rejections_total counter\n\
             ocppjd_queue_full_rejections_total {queue_full_rejections}\n\
             # HELP ocppjd_rate_limit_hits_total Rate limiter rejections since start.\n\
             # TYPE ocppjd_rate_limit_hits_total counter\n\
             ocppjd_rate_limit_hits_total {rate_limit_hits}\n\
             # HELP ocppjd_validation_failures_total Frames dropped for failing schema validation.\n\
             # TYPE ocppjd_validation_failures_total counter\n\
             ocppjd_validation_failures_total {validation_failures}\n\
             # HELP ocppjd_malformed_frames_total Frames that failed to parse as a wire message.\n\
             # TYPE ocppjd_malformed_frames_total counter\n\
             ocppjd_malformed_frames_total {malformed_frames}\n\
             # HELP ocppjd_reconnect_attempts_total Client reconnect attempts since start.\n\
             # TYPE ocppjd_reconnect_attempts_total counter\n\
             ocppjd_reconnect_attempts_total {reconnect_attempts}\n\
             # HELP ocppjd_circuit_breaker_trips_total Circuit breaker open-transitions observed since start.\n\
             # TYPE ocppjd_circuit_breaker_trips_total counter\n\
             ocppjd_circuit_breaker_trips_total {circuit_breaker_trips}\n\
             # HELP ocppjd_pings_sent_total Liveness pings sent since start.\n\
             # TYPE ocppjd_pings_sent_total counter\n\
             ocppjd_pings_sent_total {pings_sent}\n\
             # HELP ocppjd_pong_timeouts_total Connections closed for not returning a pong in time.\n\
             # TYPE ocppjd_pong_timeouts_total counter\n\
             ocppjd_pong_timeouts_total {pong_timeouts}\n\
             # HELP ocpp_connected_clients Current number of active charge point sessions.\n\
             # TYPE ocpp_connected_clients gauge\n\
             ocpp_connected_clients {active_sessions}\n\
             # HELP ocpp_memory_rss_bytes Resident set size of this process, in bytes.\n\
             # TYPE ocpp_memory_rss_bytes gauge\n\
             ocpp_memory_rss_bytes {rss_bytes}\n\
             # HELP ocpp_memory_heap_used_bytes Approximate heap in use, in bytes (RSS proxy; no allocator introspection).\n\
             # TYPE ocpp_memory_heap_used_bytes gauge\n\
             ocpp_memory_heap_used_bytes {rss_bytes}\n\
             # HELP ocpp_ws_buffered_bytes Bytes queued across all sessions' outbound mailboxes but not yet written.\n\
             # TYPE ocpp_ws_buffered_bytes gauge\n\
             ocpp_ws_buffered_bytes {ws_buffered_bytes}\n"
        )
    }
}

/// Resident set size of the current process, in bytes. `0` if it can't be
/// determined (e.g. the platform `sysinfo` can't introspect).
fn current_process_rss_bytes() -> u64 {
    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory()).unwrap_or(0)
}

impl Default for OcppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle — cheaply clonable.
pub type SharedMetrics = Arc<OcppMetrics>;
