// SPDX-License-Identifier: MIT
//! Session registry: tracks which charge point identities are currently
//! connected to this node, and garbage-collects entries that have gone
//! stale (connection dropped without a clean close, or a reconnect from a
//! duplicate identity that should evict the old one).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::endpoint::Endpoint;
use crate::queue::OutboundMailbox;

/// One connected charge point's session state.
pub struct Session {
    pub identity: String,
    pub connected_at: Instant,
    pub last_seen: Instant,
    pub remote_addr: Option<String>,
    /// Outbound mailbox for frames the router or endpoint wants delivered
    /// to this connection's socket writer task.
    pub mailbox: OutboundMailbox,
    /// The connection's RPC endpoint, attached once `run_session` has
    /// constructed it. Lets a cluster-router operation like `send_batch`
    /// reach the same outbound queue a locally-issued CALL would use,
    /// rather than writing frames directly to the mailbox.
    pub endpoint: Option<Arc<Endpoint>>,
}

/// Registry of active sessions, keyed by charge point identity.
///
/// A charge point identity maps to at most one live session per node — a
/// second connection under the same identity evicts the first, mirroring
/// how real charge points reconnect after a network blip without first
/// cleanly closing the old socket.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    /// Approximates LRU order: identities move to the back on insert/touch;
    /// `max_sessions` evicts from the front when exceeded.
    order: Mutex<VecDeque<String>>,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, usize::MAX)
    }

    pub fn with_capacity(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
            ttl,
            max_sessions,
        }
    }

    /// Register a new session for `identity`, evicting and returning any
    /// session it displaces. If the registry is at `max_sessions` capacity,
    /// the least-recently-touched identity is evicted first to resist
    /// reconnection-storm growth.
    pub async fn insert(
        &self,
        identity: &str,
        remote_addr: Option<String>,
        mailbox: OutboundMailbox,
    ) -> Option<Arc<Mutex<Session>>> {
        let now = Instant::now();
        let session = Arc::new(Mutex::new(Session {
            identity: identity.to_string(),
            connected_at: now,
            last_seen: now,
            remote_addr,
            mailbox,
            endpoint: None,
        }));
        let mut guard = self.sessions.write().await;
        let previous = guard.insert(identity.to_string(), session);
        if previous.is_some() {
            warn!(identity, "duplicate connection — evicting previous session");
        } else {
            info!(identity, "session registered");
        }

        let mut order = self.order.lock().await;
        order.retain(|id| id != identity);
        order.push_back(identity.to_string());
        if previous.is_none() && guard.len() > self.max_sessions {
            if let Some(oldest) = order.pop_front() {
                guard.remove(&oldest);
                warn!(identity = %oldest, "session registry at capacity — evicting oldest entry");
            }
        }

        previous
    }

    pub async fn remove(&self, identity: &str) {
        if self.sessions.write().await.remove(identity).is_some() {
            self.order.lock().await.retain(|id| id != identity);
            info!(identity, "session removed");
        }
    }

    pub async fn get(&self, identity: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(identity).cloned()
    }

    /// Attach the connection's RPC endpoint to its already-registered
    /// session, once `run_session` has finished constructing it. No-op if
    /// the session has already been evicted.
    pub async fn attach_endpoint(&self, identity: &str, endpoint: Arc<Endpoint>) {
        if let Some(session) = self.get(identity).await {
            session.lock().await.endpoint = Some(endpoint);
        }
    }

    pub async fn touch(&self, identity: &str) {
        if let Some(session) = self.get(identity).await {
            session.lock().await.last_seen = Instant::now();
            let mut order = self.order.lock().await;
            order.retain(|id| id != identity);
            order.push_back(identity.to_string());
        }
    }

    pub async fn len(&self) -> u64 {
        self.sessions.read().await.len() as u64
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn identities(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Sum of each active session's outbound mailbox's buffered-but-unsent
    /// byte count — the basis for the `ocpp_ws_buffered_bytes` gauge.
    pub async fn total_buffered_bytes(&self) -> u64 {
        let guard = self.sessions.read().await;
        let mut total = 0u64;
        for session in guard.values() {
            if let Ok(s) = session.try_lock() {
                total += s.mailbox.buffered_bytes() as u64;
            }
        }
        total
    }

    /// Remove sessions that have not been touched within the configured
    /// TTL. Intended to run on a periodic background task alongside the
    /// resource governor loop.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut guard = self.sessions.write().await;
        let mut expired = Vec::new();
        guard.retain(|identity, session| {
            let stale = match session.try_lock() {
                Ok(s) => now.duration_since(s.last_seen) > self.ttl,
                Err(_) => false,
            };
            if stale {
                expired.push(identity.clone());
            }
            !stale
        });
        if !expired.is_empty() {
            let mut order = self.order.lock().await;
            order.retain(|id| !expired.contains(id));
            info!(count = expired.len(), "session GC reclaimed stale sessions");
        }
        expired
    }
}

/// Run the session GC loop, sweeping every `interval` until `shutdown` is
/// cancelled.
///
/// Long-running — spawn with `tokio::spawn`.
pub async fn run_session_gc_loop(registry: Arc<SessionRegistry>, interval: Duration, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("session GC loop stopping — shutdown signaled");
                break;
            }
            _ = tick.tick() => {
                registry.sweep_expired().await;
            }
        }
    }
}
