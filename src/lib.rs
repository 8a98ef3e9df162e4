pub mod circuit_breaker;
pub mod cluster;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod handler_registry;
pub mod handshake;
pub mod metrics;
pub mod queue;
pub mod rate_limiter;
pub mod resource_governor;
pub mod retry;
pub mod server;
pub mod session;
pub mod validator;
pub mod wire;

use std::sync::Arc;

use cluster::adapter::EventAdapter;
use cluster::router::ClusterRouter;
use config::{HotConfig, OcppConfig};
use metrics::SharedMetrics;
use queue::CallQueue;
use rate_limiter::{AdaptiveMultiplier, RateLimiterRegistry};
use session::SessionRegistry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use validator::ValidatorRegistry;

/// Shared application state passed to every connection task, handler, and
/// background job.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<OcppConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub router: Arc<ClusterRouter>,
    pub validators: Arc<ValidatorRegistry>,
    /// Shared across every connection's per-endpoint [`RateLimiterRegistry`]
    /// and the resource governor loop — see [`ServerContext::new_rate_limiter`].
    pub adaptive_multiplier: AdaptiveMultiplier,
    pub metrics: SharedMetrics,
    pub started_at: std::time::Instant,
    /// Identity of this cluster node (used for `ocpp:node:<identity>` channels).
    pub node_id: String,
    /// Non-critical fields a running server re-reads on every use instead of
    /// caching, so `config::ConfigWatcher` can hot-reload them without a
    /// restart. Seeded from `config` and updated in place by the watcher.
    pub hot: Arc<RwLock<HotConfig>>,
    /// Cancelled once when the server begins graceful shutdown. Every
    /// connection task derives a child token from this one for its
    /// `HandlerContext::signal`, so a single cancellation here propagates to
    /// every in-flight inbound handler across all sessions.
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(config: Arc<OcppConfig>, adapter: Arc<dyn EventAdapter>) -> Self {
        let node_id = uuid::Uuid::new_v4().to_string();
        let hot = Arc::new(RwLock::new(HotConfig::from_static(&config)));
        Self {
            sessions: Arc::new(SessionRegistry::with_capacity(config.session_ttl, config.max_sessions)),
            router: Arc::new(ClusterRouter::new(adapter, node_id.clone())),
            validators: Arc::new(ValidatorRegistry::new()),
            adaptive_multiplier: AdaptiveMultiplier::new(),
            metrics: metrics::SharedMetrics::default(),
            started_at: std::time::Instant::now(),
            node_id,
            hot,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Per-connection outbound call queue, bounded to the configured
    /// concurrency limit.
    pub fn new_call_queue(&self) -> CallQueue {
        CallQueue::new(self.config.max_in_flight_calls)
    }

    /// Fresh per-connection rate limiter (global + per-method buckets).
    /// Rate limiting is scoped to one endpoint, not shared across every
    /// connection on the node the way the circuit breaker and mailbox also
    /// aren't shared. The adaptive multiplier itself *is* shared (via
    /// `self.adaptive_multiplier`), so the resource governor's single
    /// pressure reading scales every connection's buckets together.
    pub fn new_rate_limiter(&self) -> RateLimiterRegistry {
        RateLimiterRegistry::with_shared_multiplier(self.config.rate_limit.clone(), self.adaptive_multiplier.clone())
    }
}
