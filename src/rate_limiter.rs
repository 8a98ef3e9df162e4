//! Two-tier token-bucket rate limiter: one global bucket plus a bucket
//! per distinct method name, both continuously refilled at `limit /
//! windowMs` tokens per millisecond and scaled by an adaptive multiplier the
//! resource governor drives down under CPU/RSS pressure. This is scoped to
//! one endpoint — each connection gets its own [`RateLimiterRegistry`]
//! (see [`crate::ServerContext::new_rate_limiter`]) — but every registry
//! shares one node-wide [`AdaptiveMultiplier`], so a single pressure reading
//! scales every connection's buckets together rather than each connection
//! sampling system resources independently.
//!
//! Structurally this follows the same "struct behind a lock, keyed by a
//! `HashMap`" shape as this codebase's existing per-account rate tracker,
//! but the refill model is a continuous token bucket rather than a sliding
//! window — appropriate for a per-message framework where requests arrive
//! far more densely than per-minute API calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::config::RateLimitConfig;

/// Node-wide adaptive scaling factor the resource governor drives, shared by
/// every connection's [`RateLimiterRegistry`] so one pressure reading scales
/// every bucket on the node at once rather than each connection sampling
/// system resources independently.
#[derive(Clone)]
pub struct AdaptiveMultiplier(Arc<AtomicU64>);

impl AdaptiveMultiplier {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1.0f64.to_bits())))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AdaptiveMultiplier {
    fn default() -> Self {
        Self::new()
    }
}

/// A single continuously-refilling token bucket.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: u32, window_ms: u64) -> Self {
        let capacity = limit as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: capacity / window_ms.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    /// Refill based on elapsed time, then attempt to consume one token
    /// scaled by `multiplier` (a smaller multiplier shrinks effective
    /// capacity, not just refill rate, so pressure takes effect immediately
    /// rather than only on the next window).
    fn try_consume(&mut self, multiplier: f64) -> bool {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.last_refill = now;

        let effective_capacity = self.capacity * multiplier.clamp(0.0, 1.0);
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms * multiplier.clamp(0.0, 1.0))
            .min(effective_capacity.max(1.0));

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Registry of rate limiter state for one connection: a global bucket plus
/// one bucket per distinct method name seen so far.
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    global: Mutex<TokenBucket>,
    per_method: Mutex<HashMap<String, TokenBucket>>,
    /// Shared with every other connection's registry and the resource
    /// governor loop, so a single pressure reading scales every bucket on
    /// the node without each connection polling CPU/RSS itself.
    adaptive_multiplier: AdaptiveMultiplier,
}

impl RateLimiterRegistry {
    /// Build a registry with its own, unshared adaptive multiplier — use
    /// when the caller has no resource governor wiring (tests, a client
    /// with no adaptive limiting). Production connections should use
    /// [`ServerContext::new_rate_limiter`](crate::ServerContext::new_rate_limiter),
    /// which shares the governor's multiplier.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_shared_multiplier(config, AdaptiveMultiplier::new())
    }

    pub fn with_shared_multiplier(config: RateLimitConfig, adaptive_multiplier: AdaptiveMultiplier) -> Self {
        let global = TokenBucket::new(config.global_limit, config.global_window_ms);
        Self {
            global: Mutex::new(global),
            per_method: Mutex::new(HashMap::new()),
            adaptive_multiplier,
            config,
        }
    }

    pub fn adaptive_multiplier(&self) -> f64 {
        self.adaptive_multiplier.get()
    }

    pub fn set_adaptive_multiplier(&self, multiplier: f64) {
        self.adaptive_multiplier.set(multiplier);
    }

    /// Returns `true` if the call should be allowed, having consumed one
    /// token from both the global and per-method buckets. Both checks are
    /// always performed (not short-circuited) so bucket state stays
    /// consistent even when the global check alone would reject.
    pub async fn check(&self, method: &str) -> bool {
        let multiplier = self.adaptive_multiplier();

        let global_ok = {
            let mut bucket = self.global.lock().await;
            bucket.try_consume(multiplier)
        };

        let method_ok = {
            let mut map = self.per_method.lock().await;
            let bucket = map.entry(method.to_string()).or_insert_with(|| {
                TokenBucket::new(self.config.per_method_limit, self.config.per_method_window_ms)
            });
            bucket.try_consume(multiplier)
        };

        global_ok && method_ok
    }
}
