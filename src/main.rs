use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ocppjd::cluster::adapter::InMemoryAdapter;
use ocppjd::config::OcppConfig;
use ocppjd::endpoint::ActionHandler;
use ocppjd::errors::OcppError;
use ocppjd::{config, resource_governor, server, session, ServerContext};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ocppjd", about = "OCPP-J RPC framework daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket server port.
    #[arg(long, env = "OCPPJD_PORT")]
    port: Option<u16>,

    /// Data directory for config.toml, TLS material, and the auth token.
    #[arg(long, env = "OCPPJD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "OCPPJD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "OCPPJD_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Suppress progress and informational output.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default when no subcommand is given).
    Serve,
    /// Connect outbound to a central system as a client, for testing the
    /// client role without a real charge point.
    ///
    /// Examples:
    ///   ocppjd connect wss://example.org/ocpp CP001
    Connect {
        /// Central system WebSocket URL.
        url: String,
        /// Charge point identity to connect as.
        identity: String,
    },
    /// Run startup self-checks (port availability, TLS material, config
    /// parse) and report pass/fail without starting the server.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Connect { url, identity }) => {
            run_client(url, identity, args.port, args.data_dir, args.log).await?;
        }
        Some(Command::Doctor) => {
            let ok = run_doctor(args.port, args.data_dir).await;
            std::process::exit(if ok { 0 } else { 1 });
        }
        None | Some(Command::Serve) => {
            run_server(args.port, args.data_dir, args.log).await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber. Returns a `WorkerGuard` that must
/// stay alive for the process lifetime when file logging is enabled.
///
/// Falls back to stdout-only logging if the log directory can't be
/// created — never panics on a bad log path.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("ocppjd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

fn build_context(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Arc<ServerContext> {
    let config = Arc::new(OcppConfig::new(port, data_dir, log));
    let adapter = Arc::new(InMemoryAdapter::new());
    Arc::new(ServerContext::new(config, adapter))
}

/// Action handler used when this binary runs standalone with no embedding
/// application registered — every action comes back as `NotImplemented`.
/// A real deployment links `ocppjd` as a library and supplies its own
/// `ActionHandler` wired to actual charge-point business logic.
struct PassthroughHandler;

#[async_trait]
impl ActionHandler for PassthroughHandler {
    async fn handle(
        &self,
        _protocol: Option<&str>,
        action: &str,
        _payload: serde_json::Value,
        _context: ocppjd::endpoint::HandlerContext,
    ) -> Result<Option<serde_json::Value>, OcppError> {
        Err(OcppError::not_implemented(action))
    }
}

async fn run_server(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Result<()> {
    let ctx = build_context(port, data_dir, log);
    info!(port = ctx.config.port, node_id = %ctx.node_id, "starting ocppjd");

    let watcher = config::ConfigWatcher::start(&ctx.config.data_dir, ctx.hot.clone());
    if watcher.is_none() {
        warn!("config hot-reload disabled — continuing with static config");
    }

    let governor = Arc::new(resource_governor::ResourceGovernor::new(ctx.config.resource.clone()));
    tokio::spawn(resource_governor::run_governor_loop(
        governor,
        ctx.adaptive_multiplier.clone(),
        ctx.config.resource.clone(),
    ));

    tokio::spawn(session::run_session_gc_loop(
        ctx.sessions.clone(),
        ctx.config.session_ttl,
        ctx.shutdown.clone(),
    ));

    tokio::spawn(ocppjd::cluster::router::run_cluster_delivery_loop(
        ctx.router.clone(),
        ctx.sessions.clone(),
    ));

    tokio::spawn(ocppjd::cluster::router::run_presence_refresh_loop(
        ctx.router.clone(),
        ctx.sessions.clone(),
        ctx.config.cluster.presence_ttl,
    ));

    let handler: Arc<dyn ActionHandler> = Arc::new(PassthroughHandler);
    server::run(ctx, handler).await
}

async fn run_client(url: String, identity: String, port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Result<()> {
    let ctx = build_context(port, data_dir, log);
    let handler: Arc<dyn ActionHandler> = Arc::new(PassthroughHandler);
    info!(url, identity, "starting ocppjd client");
    ocppjd::client::run(url, identity, ctx, handler).await
}

/// Self-check: can we bind the configured port, does TLS material exist if
/// a TLS-requiring security profile is configured, does config.toml parse.
async fn run_doctor(port: Option<u16>, data_dir: Option<PathBuf>) -> bool {
    let config = OcppConfig::new(port, data_dir, None);
    let mut ok = true;

    match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await {
        Ok(_) => println!("[ok]   port {} is available", config.port),
        Err(e) => {
            println!("[fail] port {} unavailable: {e}", config.port);
            ok = false;
        }
    }

    if config.security_profile.requires_tls() {
        match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => {
                println!("[ok]   TLS cert and key present");
            }
            _ => {
                println!("[fail] security profile requires TLS but cert/key paths are missing or don't exist");
                ok = false;
            }
        }
    } else {
        println!("[ok]   security profile {:?} does not require TLS", config.security_profile);
    }

    println!(
        "[ok]   rate limit: {}req/{}ms global, {}req/{}ms per-method",
        config.rate_limit.global_limit,
        config.rate_limit.global_window_ms,
        config.rate_limit.per_method_limit,
        config.rate_limit.per_method_window_ms
    );

    ok
}
