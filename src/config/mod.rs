use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 9000;
const DEFAULT_MAX_IN_FLIGHT_CALLS: usize = 10;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_BAD_MESSAGES: u32 = 5;
const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;
const DEFAULT_GLOBAL_RATE_LIMIT: u32 = 100;
const DEFAULT_GLOBAL_RATE_WINDOW_MS: u64 = 1_000;
const DEFAULT_PER_METHOD_RATE_LIMIT: u32 = 20;
const DEFAULT_PER_METHOD_RATE_WINDOW_MS: u64 = 1_000;
const DEFAULT_MAX_RESOURCE_PERCENT: u8 = 75;
const DEFAULT_EMERGENCY_RESOURCE_PERCENT: u8 = 92;
const DEFAULT_RESOURCE_POLL_SECS: u64 = 5;
const DEFAULT_RESOURCE_COOLDOWN_SECS: u64 = 10;
const DEFAULT_RECONNECT_BACKOFF_MIN_MS: u64 = 1_000;
const DEFAULT_RECONNECT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 65_536;
const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PONG_TIMEOUT_EXTRA_MS: u64 = 5_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_SESSIONS: usize = 50_000;
const DEFAULT_OFFLINE_QUEUE_MAX_SIZE: usize = 100;
const DEFAULT_PRESENCE_TTL_SECS: u64 = 300;
const DEFAULT_STREAM_MAX_LEN: usize = 1_000;
const DEFAULT_STREAM_TTL_SECS: u64 = 300;
const DEFAULT_BACKPRESSURE_THRESHOLD_BYTES: usize = 512 * 1024;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// Rate-limit knobs, mirrored 1:1 with [`RateLimitConfig`].
#[derive(Debug, Clone, Deserialize, Default)]
struct TomlRateLimit {
    global_limit: Option<u32>,
    global_window_ms: Option<u64>,
    per_method_limit: Option<u32>,
    per_method_window_ms: Option<u64>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 9000).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,ocppjd=trace" (default: "info").
    log: Option<String>,
    /// Maximum outbound calls in flight per connection before new calls queue.
    max_in_flight_calls: Option<usize>,
    /// Seconds to wait for a CALLRESULT/CALLERROR before timing out a call.
    call_timeout_secs: Option<u64>,
    /// Consecutive malformed frames tolerated before closing with 1002.
    max_bad_messages: Option<u32>,
    /// Seconds a presence entry may go unseen before session GC reclaims it.
    session_ttl_secs: Option<u64>,
    /// Security profile: 0 (none), 1 (Basic/ws), 2 (Basic/wss), 3 (mTLS/wss).
    security_profile: Option<u8>,
    /// PEM certificate chain path (profiles 2 and 3).
    tls_cert_path: Option<PathBuf>,
    /// PEM private key path (profiles 2 and 3).
    tls_key_path: Option<PathBuf>,
    /// PEM CA bundle used to verify client certificates (profile 3 only).
    tls_client_ca_path: Option<PathBuf>,
    /// Whether CALLERROR frames include the internal error message in
    /// `description`/`details`, or a generic message only.
    respond_with_detailed_errors: Option<bool>,
    /// Reject unknown subprotocols instead of falling back to none.
    strict_mode: Option<bool>,
    /// Subprotocols this server accepts, in priority order.
    subprotocols: Option<Vec<String>>,
    rate_limit: Option<TomlRateLimit>,
    max_resource_percent: Option<u8>,
    emergency_resource_percent: Option<u8>,
    resource_poll_interval_secs: Option<u64>,
    /// Seconds without pressure before the adaptive multiplier starts recovering.
    resource_cooldown_secs: Option<u64>,
    reconnect_backoff_min_ms: Option<u64>,
    reconnect_backoff_max_ms: Option<u64>,
    /// Per-frame upper bound; frames beyond this are rejected before JSON parse.
    max_payload_bytes: Option<usize>,
    /// Interval between liveness pings on an idle connection.
    ping_interval_ms: Option<u64>,
    /// Extra time beyond the ping interval to wait for a pong before closing.
    pong_timeout_extra_ms: Option<u64>,
    /// Skip sending a ping if the connection has seen traffic more recently
    /// than `ping_interval_ms` ago.
    defer_pings_on_activity: Option<bool>,
    /// Deadline for a registered auth callback to settle during upgrade.
    handshake_timeout_ms: Option<u64>,
    /// LRU cap on the session registry to resist reconnection-storm growth.
    max_sessions: Option<usize>,
    /// Drop-oldest cap on a connection's offline call queue.
    offline_queue_max_size: Option<usize>,
    /// TTL for a presence KV entry.
    presence_ttl_secs: Option<u64>,
    /// Trim length for a cluster unicast stream.
    stream_max_len: Option<usize>,
    /// TTL for a cluster unicast stream key.
    stream_ttl_secs: Option<u64>,
    /// Buffered-byte ceiling before a backpressure event is emitted.
    backpressure_threshold_bytes: Option<usize>,
    /// Bounded window to let in-flight handlers finish during graceful
    /// shutdown before connections are torn down unconditionally.
    shutdown_grace_ms: Option<u64>,
    /// Front-door gate: if set, only these peer IPs may open a connection.
    ip_allowlist: Option<Vec<std::net::IpAddr>>,
    /// Front-door gate: if set, an `Origin` header must match one of these
    /// exactly (or be absent) to proceed past the upgrade.
    cors_allowed_origins: Option<Vec<String>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Sub-configs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global_limit: u32,
    pub global_window_ms: u64,
    pub per_method_limit: u32,
    pub per_method_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_limit: DEFAULT_GLOBAL_RATE_LIMIT,
            global_window_ms: DEFAULT_GLOBAL_RATE_WINDOW_MS,
            per_method_limit: DEFAULT_PER_METHOD_RATE_LIMIT,
            per_method_window_ms: DEFAULT_PER_METHOD_RATE_WINDOW_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub max_resource_percent: u8,
    pub emergency_resource_percent: u8,
    pub poll_interval_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_resource_percent: DEFAULT_MAX_RESOURCE_PERCENT,
            emergency_resource_percent: DEFAULT_EMERGENCY_RESOURCE_PERCENT,
            poll_interval_secs: DEFAULT_RESOURCE_POLL_SECS,
            cooldown_secs: DEFAULT_RESOURCE_COOLDOWN_SECS,
        }
    }
}

/// Security profile 0-3, as defined by the wire spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProfile {
    /// No transport security, no authentication.
    None,
    /// HTTP Basic Auth over plain `ws://`.
    BasicAuthUnsecured,
    /// HTTP Basic Auth over `wss://`.
    BasicAuthTls,
    /// Mutual TLS — client certificate required over `wss://`.
    MutualTls,
}

impl SecurityProfile {
    pub fn from_u8(n: u8) -> Self {
        match n {
            1 => SecurityProfile::BasicAuthUnsecured,
            2 => SecurityProfile::BasicAuthTls,
            3 => SecurityProfile::MutualTls,
            _ => SecurityProfile::None,
        }
    }

    pub fn requires_tls(self) -> bool {
        matches!(self, SecurityProfile::BasicAuthTls | SecurityProfile::MutualTls)
    }
}

/// TLS material paths, only consulted when the security profile requires TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub client_ca_path: Option<PathBuf>,
}

/// Ping/pong dead-peer detection knobs.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub defer_pings_on_activity: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        let ping_interval = Duration::from_millis(DEFAULT_PING_INTERVAL_MS);
        Self {
            pong_timeout: ping_interval + Duration::from_millis(DEFAULT_PONG_TIMEOUT_EXTRA_MS),
            ping_interval,
            defer_pings_on_activity: true,
        }
    }
}

/// Cluster unicast / presence knobs shared by the event adapter and router.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub presence_ttl: Duration,
    pub stream_max_len: usize,
    pub stream_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            presence_ttl: Duration::from_secs(DEFAULT_PRESENCE_TTL_SECS),
            stream_max_len: DEFAULT_STREAM_MAX_LEN,
            stream_ttl: Duration::from_secs(DEFAULT_STREAM_TTL_SECS),
        }
    }
}

// ─── OcppConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OcppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub max_in_flight_calls: usize,
    pub call_timeout: Duration,
    pub max_bad_messages: u32,
    pub session_ttl: Duration,
    pub security_profile: SecurityProfile,
    pub tls: TlsConfig,
    pub respond_with_detailed_errors: bool,
    pub strict_mode: bool,
    pub subprotocols: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub resource: ResourceConfig,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,
    pub max_payload_bytes: usize,
    pub liveness: LivenessConfig,
    pub handshake_timeout: Duration,
    pub max_sessions: usize,
    pub offline_queue_max_size: usize,
    pub cluster: ClusterConfig,
    pub backpressure_threshold_bytes: usize,
    pub shutdown_grace: Duration,
    /// If set, only these peer IPs may open a connection.
    pub ip_allowlist: Option<Vec<std::net::IpAddr>>,
    /// If set, an `Origin` header must match one of these exactly (or be
    /// absent) to proceed past the upgrade.
    pub cors_allowed_origins: Option<Vec<String>>,
}

impl OcppConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_in_flight_calls = toml.max_in_flight_calls.unwrap_or(DEFAULT_MAX_IN_FLIGHT_CALLS);
        let call_timeout = Duration::from_secs(toml.call_timeout_secs.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS));
        let max_bad_messages = toml.max_bad_messages.unwrap_or(DEFAULT_MAX_BAD_MESSAGES);
        let session_ttl = Duration::from_secs(toml.session_ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS));
        let security_profile = SecurityProfile::from_u8(
            std::env::var("OCPPJD_SECURITY_PROFILE")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(toml.security_profile)
                .unwrap_or(0),
        );
        let respond_with_detailed_errors = toml.respond_with_detailed_errors.unwrap_or(false);
        let strict_mode = toml.strict_mode.unwrap_or(false);
        let subprotocols = toml
            .subprotocols
            .clone()
            .unwrap_or_else(|| vec!["ocpp2.0.1".to_string(), "ocpp1.6".to_string()]);

        let tls = TlsConfig {
            cert_path: toml.tls_cert_path.clone(),
            key_path: toml.tls_key_path.clone(),
            client_ca_path: toml.tls_client_ca_path.clone(),
        };

        let rl = toml.rate_limit.clone().unwrap_or_default();
        let rate_limit = RateLimitConfig {
            global_limit: rl.global_limit.unwrap_or(DEFAULT_GLOBAL_RATE_LIMIT),
            global_window_ms: rl.global_window_ms.unwrap_or(DEFAULT_GLOBAL_RATE_WINDOW_MS),
            per_method_limit: rl.per_method_limit.unwrap_or(DEFAULT_PER_METHOD_RATE_LIMIT),
            per_method_window_ms: rl
                .per_method_window_ms
                .unwrap_or(DEFAULT_PER_METHOD_RATE_WINDOW_MS),
        };

        let resource = ResourceConfig {
            max_resource_percent: toml.max_resource_percent.unwrap_or(DEFAULT_MAX_RESOURCE_PERCENT),
            emergency_resource_percent: toml
                .emergency_resource_percent
                .unwrap_or(DEFAULT_EMERGENCY_RESOURCE_PERCENT),
            poll_interval_secs: toml.resource_poll_interval_secs.unwrap_or(DEFAULT_RESOURCE_POLL_SECS),
            cooldown_secs: toml.resource_cooldown_secs.unwrap_or(DEFAULT_RESOURCE_COOLDOWN_SECS),
        };

        let reconnect_backoff_min =
            Duration::from_millis(toml.reconnect_backoff_min_ms.unwrap_or(DEFAULT_RECONNECT_BACKOFF_MIN_MS));
        let reconnect_backoff_max =
            Duration::from_millis(toml.reconnect_backoff_max_ms.unwrap_or(DEFAULT_RECONNECT_BACKOFF_MAX_MS));

        let max_payload_bytes = toml.max_payload_bytes.unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES);
        let ping_interval = Duration::from_millis(toml.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL_MS));
        let pong_timeout = ping_interval
            + Duration::from_millis(toml.pong_timeout_extra_ms.unwrap_or(DEFAULT_PONG_TIMEOUT_EXTRA_MS));
        let liveness = LivenessConfig {
            ping_interval,
            pong_timeout,
            defer_pings_on_activity: toml.defer_pings_on_activity.unwrap_or(true),
        };
        let handshake_timeout = Duration::from_millis(toml.handshake_timeout_ms.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS));
        let max_sessions = toml.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS);
        let offline_queue_max_size = toml.offline_queue_max_size.unwrap_or(DEFAULT_OFFLINE_QUEUE_MAX_SIZE);
        let cluster = ClusterConfig {
            presence_ttl: Duration::from_secs(toml.presence_ttl_secs.unwrap_or(DEFAULT_PRESENCE_TTL_SECS)),
            stream_max_len: toml.stream_max_len.unwrap_or(DEFAULT_STREAM_MAX_LEN),
            stream_ttl: Duration::from_secs(toml.stream_ttl_secs.unwrap_or(DEFAULT_STREAM_TTL_SECS)),
        };
        let backpressure_threshold_bytes = toml
            .backpressure_threshold_bytes
            .unwrap_or(DEFAULT_BACKPRESSURE_THRESHOLD_BYTES);
        let shutdown_grace = Duration::from_millis(toml.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS));
        let ip_allowlist = toml.ip_allowlist.clone();
        let cors_allowed_origins = toml.cors_allowed_origins.clone();

        Self {
            port,
            data_dir,
            log,
            max_in_flight_calls,
            call_timeout,
            max_bad_messages,
            session_ttl,
            security_profile,
            tls,
            respond_with_detailed_errors,
            strict_mode,
            subprotocols,
            rate_limit,
            resource,
            reconnect_backoff_min,
            reconnect_backoff_max,
            max_payload_bytes,
            liveness,
            handshake_timeout,
            max_sessions,
            offline_queue_max_size,
            cluster,
            backpressure_threshold_bytes,
            shutdown_grace,
            ip_allowlist,
            cors_allowed_origins,
        }
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────────

/// Non-critical config fields that can be changed without restarting.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub max_bad_messages: u32,
}

impl HotConfig {
    /// Snapshot of the statically-loaded config's hot-reloadable fields, used
    /// to seed `ServerContext::hot` before any watcher has fired.
    pub fn from_static(config: &OcppConfig) -> Self {
        Self {
            log_level: config.log.clone(),
            max_bad_messages: config.max_bad_messages,
        }
    }
}

/// Watches `config.toml` for changes and reloads non-critical fields.
///
/// Uses the `notify` crate (kqueue on macOS, inotify on Linux). Port, TLS
/// paths, and security profile require a full restart.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `{data_dir}/config.toml` for changes, writing reloads
    /// into `hot` — typically the same handle a `ServerContext` reads from,
    /// so callers see updates without any extra plumbing.
    ///
    /// Returns `None` if the watcher could not be created (non-fatal; the
    /// server runs fine without hot-reload).
    pub fn start(data_dir: &Path, hot: Arc<RwLock<HotConfig>>) -> Option<Self> {
        let config_path = data_dir.join("config.toml");

        let hot_clone = hot.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level
                                || guard.max_bad_messages != new_config.max_bad_messages
                            {
                                info!(
                                    log_level = %new_config.log_level,
                                    max_bad_messages = new_config.max_bad_messages,
                                    "config.toml reloaded"
                                );
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default();
    HotConfig {
        log_level: toml.log.unwrap_or_else(|| "info".to_string()),
        max_bad_messages: toml.max_bad_messages.unwrap_or(DEFAULT_MAX_BAD_MESSAGES),
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("ocppjd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("ocppjd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("ocppjd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("ocppjd");
        }
    }
    PathBuf::from(".ocppjd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OcppConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.security_profile, SecurityProfile::None);
        assert!(!cfg.respond_with_detailed_errors);
    }

    #[test]
    fn cli_overrides_beat_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OcppConfig::new(Some(9999), Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 9999);
    }

    #[test]
    fn toml_overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 7777\nmax_bad_messages = 2\n",
        )
        .unwrap();
        let cfg = OcppConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.port, 7777);
        assert_eq!(cfg.max_bad_messages, 2);
    }
}
