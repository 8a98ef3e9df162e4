// SPDX-License-Identifier: MIT
//! The broker driver contract.
//!
//! A production deployment runs one `ocppjd` process per node behind a load
//! balancer. A charge point's WebSocket lands on exactly one node, but an
//! operator call to that charge point can originate on any node — the
//! adapter is how a node publishes "route this frame to identity X" and
//! hears about frames other nodes routed to identities connected locally.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

/// A frame routed across the cluster: either a point-to-point delivery to
/// one charge point identity, or a broadcast to every node.
#[derive(Debug, Clone)]
pub struct ClusterEnvelope {
    /// Charge point identity this frame is destined for, or `None` for a
    /// cluster-wide broadcast (e.g. a config hot-reload notice).
    pub target_identity: Option<String>,
    /// Node that published this envelope, used to avoid a node re-delivering
    /// its own publish to itself.
    pub origin_node_id: String,
    /// The raw wire frame (already-serialized CALL/CALLRESULT/CALLERROR).
    pub frame: String,
    /// Monotonically increasing per-identity sequence number for unicast
    /// deliveries (`ocpp:node:<identity>`); `0` for broadcasts, which carry
    /// no ordering guarantee across nodes.
    pub seq: u64,
}

/// Driver contract a broker-backed deployment implements to fan frames out
/// across nodes.
///
/// Implementations must be cheaply cloneable (`Arc`-wrapped by callers) and
/// safe to call concurrently from many connection tasks. The presence KV and
/// per-identity `__seq` counters model the `set/get/mget/del` and
/// `xadd/xread/xlen` primitives a broker-backed driver (Redis Streams, NATS
/// JetStream) exposes; the in-memory variant below keeps them in a guarded
/// map instead of calling out to a broker.
#[async_trait]
pub trait EventAdapter: Send + Sync {
    /// Publish an envelope for other nodes to see.
    async fn publish(&self, envelope: ClusterEnvelope) -> anyhow::Result<()>;

    /// Subscribe to envelopes published by any node (including, potentially,
    /// this one — callers filter out their own `origin_node_id`).
    fn subscribe(&self) -> broadcast::Receiver<ClusterEnvelope>;

    /// Record that `identity` is currently held open by `node_id`, expiring
    /// after `ttl` unless refreshed.
    async fn set_presence(&self, identity: &str, node_id: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Look up which node currently holds `identity`'s open connection, if
    /// any unexpired entry exists.
    async fn get_presence(&self, identity: &str) -> anyhow::Result<Option<String>>;

    /// Remove a presence entry (on clean disconnect, or when a lookup finds
    /// it stale).
    async fn remove_presence(&self, identity: &str) -> anyhow::Result<()>;

    /// Batch lookup; identities with no unexpired entry are omitted from the
    /// result map.
    async fn get_presence_batch(&self, identities: &[String]) -> anyhow::Result<HashMap<String, String>>;

    /// Batch assert — used on broker reconnect to re-assert every locally
    /// held identity in one round trip.
    async fn set_presence_batch(&self, entries: &[(String, String)], ttl: Duration) -> anyhow::Result<()>;

    /// Allocate the next `__seq` value for `identity`'s unicast stream.
    async fn next_seq(&self, identity: &str) -> u64;

    /// Release any broker-side resources (connection pool, subscription
    /// handles) held by this adapter, called once as the last step of
    /// server shutdown. The in-memory adapter has nothing to release.
    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory stand-in: every "node" is really just a clone of the same
/// broadcast channel within one process, and presence/`__seq` state lives in
/// a guarded map rather than a broker. Useful for tests and single-node
/// deployments; a real multi-node deployment supplies its own adapter
/// backed by an actual broker.
pub struct InMemoryAdapter {
    tx: broadcast::Sender<ClusterEnvelope>,
    presence: StdMutex<HashMap<String, (String, Instant)>>,
    seqs: StdMutex<HashMap<String, u64>>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self {
            tx,
            presence: StdMutex::new(HashMap::new()),
            seqs: StdMutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventAdapter for InMemoryAdapter {
    async fn publish(&self, envelope: ClusterEnvelope) -> anyhow::Result<()> {
        // No subscribers is fine — mirrors the broadcast-based notifier
        // elsewhere in this codebase that also ignores send errors.
        let _ = self.tx.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEnvelope> {
        self.tx.subscribe()
    }

    async fn set_presence(&self, identity: &str, node_id: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut guard = self.presence.lock().expect("presence lock poisoned");
        guard.insert(identity.to_string(), (node_id.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get_presence(&self, identity: &str) -> anyhow::Result<Option<String>> {
        let mut guard = self.presence.lock().expect("presence lock poisoned");
        match guard.get(identity) {
            Some((node_id, expires_at)) if *expires_at > Instant::now() => Ok(Some(node_id.clone())),
            Some(_) => {
                guard.remove(identity);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove_presence(&self, identity: &str) -> anyhow::Result<()> {
        self.presence.lock().expect("presence lock poisoned").remove(identity);
        Ok(())
    }

    async fn get_presence_batch(&self, identities: &[String]) -> anyhow::Result<HashMap<String, String>> {
        let mut guard = self.presence.lock().expect("presence lock poisoned");
        let now = Instant::now();
        let mut out = HashMap::new();
        let mut stale = Vec::new();
        for identity in identities {
            match guard.get(identity) {
                Some((node_id, expires_at)) if *expires_at > now => {
                    out.insert(identity.clone(), node_id.clone());
                }
                Some(_) => stale.push(identity.clone()),
                None => {}
            }
        }
        for identity in stale {
            guard.remove(&identity);
        }
        Ok(out)
    }

    async fn set_presence_batch(&self, entries: &[(String, String)], ttl: Duration) -> anyhow::Result<()> {
        let mut guard = self.presence.lock().expect("presence lock poisoned");
        let expires_at = Instant::now() + ttl;
        for (identity, node_id) in entries {
            guard.insert(identity.clone(), (node_id.clone(), expires_at));
        }
        Ok(())
    }

    async fn next_seq(&self, identity: &str) -> u64 {
        let mut guard = self.seqs.lock().expect("seq lock poisoned");
        let entry = guard.entry(identity.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let adapter = InMemoryAdapter::new();
        let mut rx = adapter.subscribe();
        adapter
            .publish(ClusterEnvelope {
                target_identity: Some("CP001".to_string()),
                origin_node_id: "node-a".to_string(),
                frame: "[2,\"1\",\"Reset\",{}]".to_string(),
                seq: 1,
            })
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.target_identity.as_deref(), Some("CP001"));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let adapter = InMemoryAdapter::new();
        let result = adapter
            .publish(ClusterEnvelope {
                target_identity: None,
                origin_node_id: "node-a".to_string(),
                frame: "{}".to_string(),
                seq: 0,
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn presence_roundtrip_and_expiry() {
        let adapter = InMemoryAdapter::new();
        adapter.set_presence("CP001", "node-a", Duration::from_millis(20)).await.unwrap();
        assert_eq!(adapter.get_presence("CP001").await.unwrap().as_deref(), Some("node-a"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(adapter.get_presence("CP001").await.unwrap(), None);
    }

    #[tokio::test]
    async fn presence_removed_on_disconnect() {
        let adapter = InMemoryAdapter::new();
        adapter.set_presence("CP001", "node-a", Duration::from_secs(60)).await.unwrap();
        adapter.remove_presence("CP001").await.unwrap();
        assert_eq!(adapter.get_presence("CP001").await.unwrap(), None);
    }

    #[tokio::test]
    async fn presence_batch_set_then_get_matches() {
        let adapter = InMemoryAdapter::new();
        let entries = vec![
            ("CP001".to_string(), "node-a".to_string()),
            ("CP002".to_string(), "node-a".to_string()),
        ];
        adapter.set_presence_batch(&entries, Duration::from_secs(60)).await.unwrap();

        let identities = vec!["CP001".to_string(), "CP002".to_string(), "CP003".to_string()];
        let got = adapter.get_presence_batch(&identities).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got.get("CP001").map(String::as_str), Some("node-a"));
        assert!(!got.contains_key("CP003"));
    }

    #[tokio::test]
    async fn seq_is_monotonically_increasing_per_identity() {
        let adapter = InMemoryAdapter::new();
        assert_eq!(adapter.next_seq("CP001").await, 1);
        assert_eq!(adapter.next_seq("CP001").await, 2);
        assert_eq!(adapter.next_seq("CP002").await, 1);
    }
}
