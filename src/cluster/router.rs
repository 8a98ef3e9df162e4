// SPDX-License-Identifier: MIT
//! Cluster router: resolves "deliver this frame to identity X" into a
//! local mailbox write when the session is connected to this node, or an
//! [`EventAdapter`] publish when it's (or might be) connected elsewhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::cluster::adapter::{ClusterEnvelope, EventAdapter};
use crate::session::SessionRegistry;

/// Routes outbound frames to charge point identities, whether they're
/// connected to this node or another one in the cluster.
pub struct ClusterRouter {
    adapter: Arc<dyn EventAdapter>,
    node_id: String,
}

impl ClusterRouter {
    pub fn new(adapter: Arc<dyn EventAdapter>, node_id: String) -> Self {
        Self { adapter, node_id }
    }

    /// Deliver `frame` to `identity`. Checks `sessions` for a local
    /// connection first; if absent, looks up presence and publishes to the
    /// owning node's unicast stream with a fresh `__seq`. Fails if no
    /// presence entry exists — the identity isn't open anywhere in the
    /// cluster.
    pub async fn send_to_identity(
        &self,
        sessions: &SessionRegistry,
        identity: &str,
        frame: String,
    ) -> anyhow::Result<()> {
        if let Some(session) = sessions.get(identity).await {
            let session = session.lock().await;
            if let Err(e) = session.mailbox.send(frame.clone()).await {
                warn!(identity, err = %e, "local delivery failed — falling back to cluster publish");
            } else {
                debug!(identity, "delivered locally");
                return Ok(());
            }
        }

        match self.adapter.get_presence(identity).await? {
            Some(node_id) if node_id == self.node_id => {
                // Presence says we hold it, but the session is gone — stale
                // entry left over from an ungraceful disconnect.
                self.adapter.remove_presence(identity).await.ok();
                anyhow::bail!("identity {identity} not connected locally despite presence entry — removed stale entry");
            }
            Some(_node_id) => {
                let seq = self.adapter.next_seq(identity).await;
                self.adapter
                    .publish(ClusterEnvelope {
                        target_identity: Some(identity.to_string()),
                        origin_node_id: self.node_id.clone(),
                        frame,
                        seq,
                    })
                    .await
            }
            None => anyhow::bail!("identity {identity} has no presence entry in the cluster"),
        }
    }

    /// Issue a batch of outbound CALLs to one identity's endpoint,
    /// temporarily raising its work-queue concurrency to `calls.len()` so
    /// none of them wait behind each other, then restoring it. Fails
    /// outright if `identity` isn't connected to this node — unlike
    /// `send_to_identity`, there's no cluster-wide forwarding path for a
    /// request/response batch, since the adapter only carries one-way
    /// publishes between nodes.
    pub async fn send_batch(
        &self,
        sessions: &SessionRegistry,
        identity: &str,
        calls: Vec<(String, serde_json::Value, crate::endpoint::CallOptions)>,
    ) -> anyhow::Result<Vec<Option<serde_json::Value>>> {
        let session = sessions
            .get(identity)
            .await
            .ok_or_else(|| anyhow::anyhow!("identity {identity} not connected to this node"))?;
        let endpoint = session
            .lock()
            .await
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("identity {identity} has no endpoint attached yet"))?;
        Ok(endpoint.send_batch(calls).await)
    }

    /// Broadcast `frame` to every connected identity on every node.
    pub async fn broadcast(&self, sessions: &SessionRegistry, frame: String) -> anyhow::Result<()> {
        for identity in sessions.identities().await {
            if let Some(session) = sessions.get(&identity).await {
                let _ = session.lock().await.mailbox.send(frame.clone()).await;
            }
        }
        self.adapter
            .publish(ClusterEnvelope {
                target_identity: None,
                origin_node_id: self.node_id.clone(),
                frame,
                seq: 0,
            })
            .await
    }

    /// Subscribe to cluster envelopes so a background task can deliver
    /// frames destined for identities connected to this node but published
    /// by another.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEnvelope> {
        self.adapter.subscribe()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Assert that `identity` is open on this node, refreshed on every
    /// heartbeat and cleared on disconnect by the caller.
    pub async fn set_presence(&self, identity: &str, ttl: Duration) -> anyhow::Result<()> {
        self.adapter.set_presence(identity, &self.node_id, ttl).await
    }

    pub async fn remove_presence(&self, identity: &str) -> anyhow::Result<()> {
        self.adapter.remove_presence(identity).await
    }

    /// Release the underlying adapter's broker resources. Called once as
    /// the last step of server shutdown, after listeners are closed.
    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.adapter.disconnect().await
    }

    /// Re-assert every locally held identity's presence in one batch —
    /// called after the adapter's reconnect hook fires.
    pub async fn reassert_presence(&self, identities: &[String], ttl: Duration) -> anyhow::Result<()> {
        let entries: Vec<(String, String)> = identities.iter().map(|id| (id.clone(), self.node_id.clone())).collect();
        self.adapter.set_presence_batch(&entries, ttl).await
    }
}

/// Background task: periodically re-asserts presence for every identity
/// open on this node, so a KV entry with a shorter TTL than the session's
/// actual lifetime doesn't expire out from under a still-open connection.
/// Runs at half the configured TTL.
///
/// Long-running — spawn with `tokio::spawn`.
pub async fn run_presence_refresh_loop(router: Arc<ClusterRouter>, sessions: Arc<SessionRegistry>, ttl: Duration) {
    let interval = (ttl / 2).max(Duration::from_secs(1));
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        let identities = sessions.identities().await;
        if identities.is_empty() {
            continue;
        }
        if let Err(e) = router.reassert_presence(&identities, ttl).await {
            warn!(err = %e, "presence refresh failed");
        }
    }
}

/// Background task: consumes cluster envelopes and delivers the ones
/// targeting an identity connected to this node. Envelopes this node
/// originated are skipped to avoid double delivery. Per-identity `__seq`
/// tracking discards duplicate or out-of-order unicast entries — a
/// reconnect storm or a broker at-least-once redelivery must not replay an
/// already-applied CALL.
///
/// Long-running — spawn with `tokio::spawn`.
pub async fn run_cluster_delivery_loop(router: Arc<ClusterRouter>, sessions: Arc<SessionRegistry>) {
    let mut rx = router.subscribe();
    let last_seen_seq: Mutex<HashMap<String, u64>> = Mutex::new(HashMap::new());
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if envelope.origin_node_id == router.node_id {
                    continue;
                }
                match envelope.target_identity {
                    Some(identity) => {
                        if envelope.seq > 0 {
                            let mut guard = last_seen_seq.lock().await;
                            let last = guard.get(&identity).copied().unwrap_or(0);
                            if envelope.seq <= last {
                                debug!(identity, seq = envelope.seq, last, "discarding duplicate/out-of-order unicast entry");
                                continue;
                            }
                            guard.insert(identity.clone(), envelope.seq);
                        }
                        if let Some(session) = sessions.get(&identity).await {
                            let _ = session.lock().await.mailbox.send(envelope.frame).await;
                        }
                    }
                    None => {
                        for identity in sessions.identities().await {
                            if let Some(session) = sessions.get(&identity).await {
                                let _ = session.lock().await.mailbox.send(envelope.frame.clone()).await;
                            }
                        }
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cluster router lagged — some envelopes were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::adapter::InMemoryAdapter;
    use crate::queue::OutboundMailbox;
    use std::time::Duration;

    #[tokio::test]
    async fn local_session_receives_frame_directly() {
        let adapter = Arc::new(InMemoryAdapter::new());
        let router = ClusterRouter::new(adapter, "node-a".to_string());
        let sessions = SessionRegistry::new(Duration::from_secs(60));
        let (mailbox, mut rx) = OutboundMailbox::new(4);
        sessions.insert("CP001", None, mailbox).await;

        router
            .send_to_identity(&sessions, "CP001", "[2,\"1\",\"Reset\",{}]".to_string())
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, "[2,\"1\",\"Reset\",{}]");
    }

    #[tokio::test]
    async fn send_batch_fails_for_an_identity_not_connected_here() {
        let adapter = Arc::new(InMemoryAdapter::new());
        let router = ClusterRouter::new(adapter, "node-a".to_string());
        let sessions = SessionRegistry::new(Duration::from_secs(60));

        let result = router.send_batch(&sessions, "CP999", vec![]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_batch_issues_all_calls_against_the_attached_endpoint() {
        use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
        use crate::endpoint::{CallOptions, Endpoint};
        use crate::metrics::OcppMetrics;
        use crate::wire::Message as WireMessage;

        let adapter = Arc::new(InMemoryAdapter::new());
        let router = ClusterRouter::new(adapter, "node-a".to_string());
        let sessions = SessionRegistry::new(Duration::from_secs(60));
        let (mailbox, mut rx) = OutboundMailbox::new(8);
        sessions.insert("CP001", None, mailbox.clone()).await;

        let endpoint = Arc::new(Endpoint::new(
            mailbox,
            crate::queue::CallQueue::new(1),
            CircuitBreaker::new("test", CircuitBreakerConfig::default()),
            Arc::new(OcppMetrics::new()),
            Duration::from_secs(1),
        ));
        sessions.attach_endpoint("CP001", endpoint.clone()).await;

        let sessions = Arc::new(sessions);
        let router = Arc::new(router);
        let batch_sessions = sessions.clone();
        let batch_router = router.clone();
        let handle = tokio::spawn(async move {
            batch_router
                .send_batch(
                    &batch_sessions,
                    "CP001",
                    vec![
                        ("A".to_string(), serde_json::json!({}), CallOptions { idempotency_key: Some("a".into()), ..Default::default() }),
                        ("B".to_string(), serde_json::json!({}), CallOptions { idempotency_key: Some("b".into()), ..Default::default() }),
                    ],
                )
                .await
        });

        for _ in 0..2 {
            let frame = rx.recv().await.unwrap();
            let id = WireMessage::parse(&frame).unwrap().id().to_string();
            endpoint.resolve(&id, Ok(serde_json::json!("ok"))).await;
        }

        let results = handle.await.unwrap().unwrap();
        assert_eq!(results, vec![Some(serde_json::json!("ok")), Some(serde_json::json!("ok"))]);
    }

    #[tokio::test]
    async fn identity_with_no_presence_entry_fails() {
        let adapter = Arc::new(InMemoryAdapter::new());
        let router = ClusterRouter::new(adapter, "node-a".to_string());
        let sessions = SessionRegistry::new(Duration::from_secs(60));

        let result = router.send_to_identity(&sessions, "CP999", "frame".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn identity_present_on_another_node_publishes_with_seq() {
        let adapter = Arc::new(InMemoryAdapter::new());
        adapter.set_presence("CP999", "node-b", Duration::from_secs(60)).await.unwrap();
        let mut cluster_rx = adapter.subscribe();
        let router = ClusterRouter::new(adapter, "node-a".to_string());
        let sessions = SessionRegistry::new(Duration::from_secs(60));

        router
            .send_to_identity(&sessions, "CP999", "frame".to_string())
            .await
            .unwrap();

        let envelope = cluster_rx.recv().await.unwrap();
        assert_eq!(envelope.target_identity.as_deref(), Some("CP999"));
        assert_eq!(envelope.seq, 1);
    }

    #[tokio::test]
    async fn delivery_loop_discards_duplicate_seq() {
        let adapter = Arc::new(InMemoryAdapter::new());
        let router = Arc::new(ClusterRouter::new(adapter.clone(), "node-a".to_string()));
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let (mailbox, mut rx) = OutboundMailbox::new(8);
        sessions.insert("CP001", None, mailbox).await;

        tokio::spawn(run_cluster_delivery_loop(router.clone(), sessions.clone()));

        adapter
            .publish(ClusterEnvelope {
                target_identity: Some("CP001".to_string()),
                origin_node_id: "node-b".to_string(),
                frame: "first".to_string(),
                seq: 1,
            })
            .await
            .unwrap();
        adapter
            .publish(ClusterEnvelope {
                target_identity: Some("CP001".to_string()),
                origin_node_id: "node-b".to_string(),
                frame: "duplicate".to_string(),
                seq: 1,
            })
            .await
            .unwrap();
        adapter
            .publish(ClusterEnvelope {
                target_identity: Some("CP001".to_string()),
                origin_node_id: "node-b".to_string(),
                frame: "second".to_string(),
                seq: 2,
            })
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, "first");
        let second = rx.recv().await.unwrap();
        assert_eq!(second, "second");
    }
}
