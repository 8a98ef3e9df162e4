// SPDX-License-Identifier: MIT
//! Resource Governor — monitors system RAM/CPU and drives the adaptive rate
//! limiter multiplier.
//!
//! Runs a background Tokio task that polls system resources every
//! `poll_interval_secs` seconds, computes a pressure level, and scales the
//! shared rate-limiter multiplier down under pressure (and recovers it once
//! pressure subsides) so the framework sheds load before the process falls
//! over rather than after.

use std::sync::Arc;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ResourceConfig;
use crate::rate_limiter::AdaptiveMultiplier;

/// Pressure level computed from current system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    /// Below the configured budget — multiplier stays at 1.0.
    Normal,
    /// 80-95% of budget — multiplier begins halving.
    Warning,
    /// 95-100% of budget — multiplier halved again.
    Critical,
    /// Above the emergency threshold — multiplier floored.
    Emergency,
}

/// Core resource monitoring engine.
pub struct ResourceGovernor {
    config: ResourceConfig,
    sys: Mutex<System>,
}

impl ResourceGovernor {
    pub fn new(config: ResourceConfig) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        Self {
            config,
            sys: Mutex::new(sys),
        }
    }

    /// Refresh system memory stats and return current usage percentage.
    pub async fn poll_memory(&self) -> f64 {
        let mut sys = self.sys.lock().await;
        sys.refresh_memory();
        let total = sys.total_memory();
        let used = sys.used_memory();
        if total == 0 {
            return 0.0;
        }
        (used as f64 / total as f64) * 100.0
    }

    /// Refresh and return current global CPU usage percentage.
    pub async fn poll_cpu(&self) -> f32 {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu_usage();
        sys.global_cpu_usage()
    }

    /// Determine pressure level from the worse of current memory and CPU
    /// usage against the configured budget.
    pub async fn check_pressure(&self) -> PressureLevel {
        let mem_pct = self.poll_memory().await;
        let cpu_pct = self.poll_cpu().await as f64;
        let usage_pct = mem_pct.max(cpu_pct);

        let budget = self.config.max_resource_percent as f64;
        let emergency = self.config.emergency_resource_percent as f64;

        if usage_pct >= emergency {
            PressureLevel::Emergency
        } else if usage_pct >= budget {
            PressureLevel::Critical
        } else if usage_pct >= budget * 0.95 {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

const MULTIPLIER_FLOOR: f64 = 0.25;
const MULTIPLIER_RECOVERY_STEP: f64 = 0.1;

/// Run the resource governor polling loop, scaling the node-wide adaptive
/// multiplier in response to pressure transitions. Every connection's
/// [`RateLimiterRegistry`](crate::rate_limiter::RateLimiterRegistry) shares
/// this same `AdaptiveMultiplier`, so one pressure reading here scales every
/// bucket on the node.
///
/// On pressure (CPU or RSS over budget) the multiplier is halved, floored at
/// [`MULTIPLIER_FLOOR`]. Once `cooldownMs` has elapsed without pressure it
/// recovers by [`MULTIPLIER_RECOVERY_STEP`] per sample back toward 1.0.
///
/// Long-running — spawn with `tokio::spawn`.
pub async fn run_governor_loop(
    governor: Arc<ResourceGovernor>,
    multiplier_handle: AdaptiveMultiplier,
    config: ResourceConfig,
) {
    use tokio::time::{interval, Duration, Instant};

    let normal_interval = Duration::from_secs(config.poll_interval_secs);
    let fast_interval = Duration::from_secs(1);
    let cooldown = Duration::from_secs(config.cooldown_secs);
    let mut tick = interval(normal_interval);
    let mut use_fast = false;
    let mut multiplier: f64 = 1.0;
    let mut pressure_clear_since: Option<Instant> = None;

    loop {
        tick.tick().await;

        let pressure = governor.check_pressure().await;
        let under_pressure = pressure >= PressureLevel::Warning;

        if under_pressure {
            pressure_clear_since = None;
            let next = (multiplier / 2.0).max(MULTIPLIER_FLOOR);
            if next != multiplier {
                multiplier = next;
                warn!(multiplier, ?pressure, "resource pressure detected — halving adaptive multiplier");
                multiplier_handle.set(multiplier);
            }
        } else if multiplier < 1.0 {
            let clear_since = *pressure_clear_since.get_or_insert_with(Instant::now);
            if clear_since.elapsed() >= cooldown {
                let next = (multiplier + MULTIPLIER_RECOVERY_STEP).min(1.0);
                if next != multiplier {
                    multiplier = next;
                    debug!(multiplier, "resource pressure cleared — recovering adaptive multiplier");
                    multiplier_handle.set(multiplier);
                }
                // Reset the cooldown window so recovery advances by one step
                // per `cooldownMs`, not once per tick after the first wait.
                pressure_clear_since = Some(Instant::now());
            }
        } else {
            pressure_clear_since = None;
        }

        let should_fast = pressure >= PressureLevel::Warning;
        if should_fast != use_fast {
            use_fast = should_fast;
            tick = if use_fast {
                interval(fast_interval)
            } else {
                interval(normal_interval)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ResourceConfig {
        ResourceConfig {
            max_resource_percent: 70,
            emergency_resource_percent: 90,
            poll_interval_secs: 5,
            cooldown_secs: 10,
        }
    }

    #[tokio::test]
    async fn pressure_starts_computable() {
        let governor = ResourceGovernor::new(test_config());
        // Should not panic regardless of actual machine load.
        let _ = governor.check_pressure().await;
    }

    #[test]
    fn pressure_level_ordering() {
        assert!(PressureLevel::Normal < PressureLevel::Warning);
        assert!(PressureLevel::Warning < PressureLevel::Critical);
        assert!(PressureLevel::Critical < PressureLevel::Emergency);
    }
}
