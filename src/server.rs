// SPDX-License-Identifier: MIT
//! Server role: accepts WebSocket connections from charge points,
//! negotiates the subprotocol, enforces the configured security profile,
//! and hands each connection off to an [`crate::endpoint::Endpoint`].
//!
//! The same TCP listener also answers plain `GET /health` and `GET /metrics`
//! requests, distinguished from a WebSocket upgrade by peeking at the first
//! bytes before deciding how to handle the connection.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::endpoint::{dispatch_inbound, ActionHandler, Endpoint, HandlerContext};
use crate::handshake::{emit_security_event, AuthCallback, AuthDecision, HandshakeInfo, SecurityEventType};
use crate::queue::{CallQueue, OutboundMailbox};
use crate::wire::Message as WireMessage;
use crate::ServerContext;

/// A connection after the optional TLS step: either the raw TCP socket
/// (security profiles 0/1) or a completed `rustls` session over it
/// (profiles 2/3). Lets the rest of the accept pipeline — WS upgrade,
/// read/write loop — stay oblivious to which one it's holding.
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

const MAX_CONNECTIONS_PER_MIN: usize = 60;

/// Per-IP connection rate tracker, same tumbling-window shape used by the
/// rest of this codebase's connection gating.
struct ConnectionRateLimiter {
    connections: std::collections::HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self {
            connections: std::collections::HashMap::new(),
        }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - Duration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Run the WebSocket + health/metrics server until a shutdown signal
/// arrives, draining in-flight sessions on the way out.
///
/// A first SIGTERM/Ctrl-C stops accepting new connections, closes the
/// listener, cancels the session GC loop and every connection's
/// `HandlerContext::signal`, then waits up to `shutdown_grace` for
/// in-flight sessions to finish on their own. A second signal during that
/// window — or the window elapsing — aborts whatever's left outright.
pub async fn run(ctx: Arc<ServerContext>, handler: Arc<dyn ActionHandler>) -> Result<()> {
    run_with_auth(ctx, handler, None).await
}

/// Same as [`run`], but with a registered [`AuthCallback`] invoked once per
/// upgrade per the security profile's credential material. `auth: None`
/// accepts every upgrade unconditionally, same as no callback registered.
pub async fn run_with_auth(
    ctx: Arc<ServerContext>,
    handler: Arc<dyn ActionHandler>,
    auth: Option<Arc<dyn AuthCallback>>,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "server listening (WebSocket + health/metrics on same port)");

    let tls_acceptor = if ctx.config.security_profile.requires_tls() {
        Some(Arc::new(crate::handshake::build_tls_acceptor(ctx.config.security_profile, &ctx.config.tls)?))
    } else {
        None
    };

    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));
    let mut connections = JoinSet::new();

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — closing listener and draining sessions");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        ctx.metrics.inc_connections_rejected();
                        emit_security_event(SecurityEventType::ConnectionRateLimit, peer.ip(), "per-IP connection rate exceeded");
                        drop(stream);
                        continue;
                    }
                }

                if let Some(allowlist) = &ctx.config.ip_allowlist {
                    if !allowlist.contains(&peer.ip()) {
                        ctx.metrics.inc_connections_rejected();
                        emit_security_event(SecurityEventType::UpgradeAborted, peer.ip(), "peer IP not in allow-list");
                        drop(stream);
                        continue;
                    }
                }

                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                let handler = handler.clone();
                let auth = auth.clone();
                let tls_acceptor = tls_acceptor.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, peer.ip(), ctx.clone(), handler, auth, tls_acceptor).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    // No new connections are accepted once the listener is dropped.
    drop(listener);
    ctx.shutdown.cancel();

    let grace = ctx.config.shutdown_grace;
    let force_signal = make_shutdown_future();
    tokio::pin!(force_signal);
    tokio::select! {
        _ = async { while connections.join_next().await.is_some() {} } => {
            info!("all sessions drained cleanly");
        }
        _ = tokio::time::sleep(grace) => {
            warn!(grace_ms = grace.as_millis(), "shutdown grace period elapsed — aborting remaining sessions");
            connections.abort_all();
        }
        _ = &mut force_signal => {
            warn!("second shutdown signal received — forcing immediate close");
            connections.abort_all();
        }
    }
    while connections.join_next().await.is_some() {}

    for identity in ctx.sessions.identities().await {
        ctx.sessions.remove(&identity).await;
    }
    if let Err(e) = ctx.router.disconnect().await {
        warn!(err = %e, "cluster adapter disconnect failed");
    }

    info!("server stopped");
    Ok(())
}

async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// One of the non-WebSocket HTTP side-channels this server answers on the
/// same port as the RPC listener.
enum PlainHttpRoute {
    Health,
    Metrics,
    NotFound,
}

/// Respond to a plain (non-upgrade) HTTP request without going through the
/// WebSocket upgrade path.
async fn handle_plain_http(mut stream: impl AsyncWrite + Unpin, route: PlainHttpRoute, ctx: &ServerContext) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let (status, content_type, body) = match route {
        PlainHttpRoute::Metrics => (
            "200 OK",
            "text/plain; version=0.0.4",
            ctx.metrics.render_prometheus(
                ctx.sessions.len().await,
                ctx.sessions.total_buffered_bytes().await,
            ),
        ),
        PlainHttpRoute::Health => (
            "200 OK",
            "application/json",
            serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime": ctx.started_at.elapsed().as_secs(),
                "activeSessions": ctx.sessions.len().await,
                "nodeId": ctx.node_id,
                "pid": std::process::id(),
            })
            .to_string(),
        ),
        PlainHttpRoute::NotFound => ("404 Not Found", "text/plain", "not found".to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Peek the first bytes of a connection to tell a plain HTTP request from a
/// WebSocket upgrade before committing to either path: any request carrying
/// an `Upgrade: websocket` header goes through the upgrade pipeline
/// regardless of path, everything else is routed to the health/metrics
/// side-channels (or 404).
async fn peek_http_route(stream: &TcpStream) -> Option<PlainHttpRoute> {
    let mut buf = [0u8; 2048];
    let n = stream.peek(&mut buf).await.ok()?;
    let text = std::str::from_utf8(&buf[..n]).ok()?;
    let first_line = text.lines().next().unwrap_or("");
    if !first_line.starts_with("GET ") && !first_line.starts_with("HEAD ") {
        return None;
    }
    let has_upgrade_header = text
        .lines()
        .any(|line| line.to_ascii_lowercase().starts_with("upgrade:") && line.to_ascii_lowercase().contains("websocket"));
    if has_upgrade_header {
        return None;
    }
    if first_line.starts_with("GET /health ") || first_line.starts_with("HEAD /health ") {
        Some(PlainHttpRoute::Health)
    } else if first_line.starts_with("GET /metrics ") || first_line.starts_with("HEAD /metrics ") {
        Some(PlainHttpRoute::Metrics)
    } else {
        Some(PlainHttpRoute::NotFound)
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer_ip: IpAddr,
    ctx: Arc<ServerContext>,
    handler: Arc<dyn ActionHandler>,
    auth: Option<Arc<dyn AuthCallback>>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
) -> Result<()> {
    let stream = match tls_acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(ctx.config.handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => MaybeTlsStream::Tls(Box::new(tls)),
                Ok(Err(e)) => {
                    ctx.metrics.inc_connections_rejected();
                    emit_security_event(SecurityEventType::UpgradeAborted, peer_ip, &format!("TLS handshake failed: {e}"));
                    return Ok(());
                }
                Err(_elapsed) => {
                    ctx.metrics.inc_connections_rejected();
                    emit_security_event(SecurityEventType::UpgradeAborted, peer_ip, "TLS handshake timed out");
                    return Ok(());
                }
            }
        }
        None => MaybeTlsStream::Plain(stream),
    };

    // Plain-HTTP side-channel routing relies on peeking unencrypted bytes —
    // not available once a TLS session is already terminated, so `/health`
    // and `/metrics` are only reachable over an unencrypted listener.
    if let MaybeTlsStream::Plain(ref tcp) = stream {
        if let Some(route) = peek_http_route(tcp).await {
            return handle_plain_http(stream, route, &ctx).await;
        }
    }

    let client_cert = match &stream {
        MaybeTlsStream::Tls(tls) => tls.get_ref().1.peer_certificates().map(|certs| certs.to_vec()),
        MaybeTlsStream::Plain(_) => None,
    };

    let mut negotiated_subprotocol: Option<String> = None;
    let mut requested_path = String::new();
    let mut basic_auth_password: Option<Vec<u8>> = None;
    let mut cors_rejected = false;
    let supported = ctx.config.subprotocols.clone();
    let strict = ctx.config.strict_mode;
    let allowed_origins = ctx.config.cors_allowed_origins.clone();

    let callback = |req: &Request, mut response: Response| {
        requested_path = req.uri().path().to_string();
        let requested: Vec<String> = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        basic_auth_password = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(crate::handshake::parse_basic_auth_password);

        if let Some(allowed) = &allowed_origins {
            let origin = req.headers().get("Origin").and_then(|v| v.to_str().ok());
            if let Some(origin) = origin {
                if !allowed.iter().any(|a| a == origin) {
                    cors_rejected = true;
                    let mut rejection = Response::new(None);
                    *rejection.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
                    return Err(rejection);
                }
            }
        }

        match crate::handshake::negotiate_subprotocol(&requested, &supported, strict) {
            Ok(chosen) => {
                negotiated_subprotocol = chosen.clone();
                if let Some(proto) = chosen {
                    response.headers_mut().insert(
                        "Sec-WebSocket-Protocol",
                        proto.parse().expect("subprotocol header value"),
                    );
                }
                Ok(response)
            }
            Err(_) => {
                let mut rejection = Response::new(None);
                *rejection.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::BAD_REQUEST;
                Err(rejection)
            }
        }
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.config.max_payload_bytes),
        max_frame_size: Some(ctx.config.max_payload_bytes),
        ..Default::default()
    };

    let ws = match tokio::time::timeout(
        ctx.config.handshake_timeout,
        accept_hdr_async_with_config(stream, callback, Some(ws_config)),
    )
    .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            ctx.metrics.inc_connections_rejected();
            if cors_rejected {
                emit_security_event(SecurityEventType::UpgradeAborted, peer_ip, "Origin not in CORS allow-list");
            } else {
                emit_security_event(SecurityEventType::UpgradeAborted, peer_ip, &format!("handshake rejected: {e}"));
            }
            warn!(peer = %peer_ip, err = %e, "websocket handshake rejected");
            return Ok(());
        }
        Err(_elapsed) => {
            ctx.metrics.inc_connections_rejected();
            emit_security_event(SecurityEventType::UpgradeAborted, peer_ip, "handshake timed out");
            warn!(peer = %peer_ip, timeout_ms = ctx.config.handshake_timeout.as_millis(), "websocket handshake timed out");
            return Ok(());
        }
    };

    debug!(peer = %peer_ip, subprotocol = ?negotiated_subprotocol, "websocket upgrade accepted");

    // The identity is the last non-empty path segment, URL-decoded, per the
    // wire convention `wss://host/ocpp/<identity>`.
    let identity = requested_path
        .split('/')
        .rev()
        .find(|segment| !segment.is_empty())
        .map(|segment| percent_encoding::percent_decode_str(segment).decode_utf8_lossy().into_owned())
        .unwrap_or_default();
    if identity.is_empty() {
        ctx.metrics.inc_connections_rejected();
        warn!(peer = %peer_ip, "rejected connection with no identity in path");
        return Ok(());
    }

    if let Some(auth) = &auth {
        let info = HandshakeInfo {
            identity: identity.clone(),
            remote_addr: peer_ip,
            path: requested_path.clone(),
            offered_subprotocols: supported.clone(),
            negotiated_subprotocol: negotiated_subprotocol.clone(),
            security_profile: ctx.config.security_profile,
            basic_auth_password,
            client_cert,
        };

        let decision = tokio::select! {
            _ = ctx.shutdown.cancelled() => AuthDecision::Reject { code: 1001, reason: "server shutting down".to_string() },
            _ = tokio::time::sleep(ctx.config.handshake_timeout) => AuthDecision::Reject { code: 1002, reason: "auth callback timed out".to_string() },
            decision = auth.authenticate(info, ctx.shutdown.child_token()) => decision,
        };

        if let AuthDecision::Reject { code, reason } = decision {
            ctx.metrics.inc_connections_rejected();
            emit_security_event(SecurityEventType::AuthFailed, peer_ip, &reason);
            let mut ws = ws;
            let _ = ws
                .send(WsMessage::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                    code: code.into(),
                    reason: reason.into(),
                })))
                .await;
            return Ok(());
        }
    }

    ctx.metrics.inc_connections_accepted();
    run_session(ws, identity, negotiated_subprotocol, ctx, handler, peer_ip).await
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    ws: WebSocketStream<MaybeTlsStream>,
    identity: String,
    protocol: Option<String>,
    ctx: Arc<ServerContext>,
    handler: Arc<dyn ActionHandler>,
    peer_ip: IpAddr,
) -> Result<()> {
    use tokio::time::{sleep_until, Instant as TokioInstant};

    let (mut sink, mut stream) = ws.split();
    let (mailbox, mut outbound_rx) =
        OutboundMailbox::new_with_threshold(256, ctx.config.backpressure_threshold_bytes);
    let mailbox_for_writer = mailbox.clone();

    let liveness = ctx.config.liveness.clone();
    let mut last_activity = TokioInstant::now();
    let mut awaiting_pong = false;
    let mut ping_deadline = last_activity + liveness.ping_interval;

    // The registry and the endpoint share one mailbox: a cluster-routed
    // frame and a locally-issued CALL both end up on the same queue of
    // text frames written to this socket.
    ctx.sessions.insert(&identity, None, mailbox.clone()).await;
    if let Err(e) = ctx.router.set_presence(&identity, ctx.config.cluster.presence_ttl).await {
        warn!(identity, err = %e, "failed to assert cluster presence");
    }

    let breaker = crate::circuit_breaker::CircuitBreaker::new(
        format!("session-{identity}"),
        crate::circuit_breaker::CircuitBreakerConfig::default(),
    );
    let rate_limiter = ctx.new_rate_limiter();
    let endpoint = Arc::new(Endpoint::with_validators(
        mailbox,
        CallQueue::new(ctx.config.max_in_flight_calls),
        breaker,
        ctx.metrics.clone(),
        ctx.config.call_timeout,
        ctx.config.strict_mode.then(|| ctx.validators.clone()),
    ));
    ctx.sessions.attach_endpoint(&identity, endpoint.clone()).await;

    // Child of the server-wide shutdown token: cancelled either when this
    // session closes on its own, or when the whole server starts shutting
    // down, whichever comes first.
    let conn_cancel = ctx.shutdown.child_token();
    let mut bad_message_count = 0u32;

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => {
                info!(identity, "server shutting down — closing session");
                break;
            }
            _ = sleep_until(ping_deadline) => {
                if awaiting_pong {
                    ctx.metrics.inc_pong_timeouts();
                    warn!(identity, "pong not received within timeout — closing connection");
                    break;
                }
                let idle_for = last_activity.elapsed();
                if liveness.defer_pings_on_activity && idle_for < liveness.ping_interval {
                    ping_deadline = last_activity + liveness.ping_interval;
                } else if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                } else {
                    ctx.metrics.inc_pings_sent();
                    awaiting_pong = true;
                    ping_deadline = TokioInstant::now() + liveness.pong_timeout;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_activity = TokioInstant::now();
                        awaiting_pong = false;
                        ping_deadline = last_activity + liveness.ping_interval;
                        ctx.sessions.touch(&identity).await;
                        match WireMessage::parse(&text) {
                            Ok(wire_msg) => {
                                if let WireMessage::Call { ref action, .. } = wire_msg {
                                    ctx.metrics.inc_calls_received();
                                    if !rate_limiter.check(action).await {
                                        ctx.metrics.inc_rate_limit_hits();
                                        let err = crate::errors::OcppError::new(
                                            crate::errors::OcppErrorCode::RpcFrameworkError,
                                            "rate limit exceeded",
                                        );
                                        let _ = endpoint.send_error(wire_msg.id().to_string(), &err).await;
                                        continue;
                                    }
                                }
                                let context = HandlerContext { signal: conn_cancel.clone() };
                                if let Err(e) = dispatch_inbound(&endpoint, handler.as_ref(), protocol.as_deref(), wire_msg, context).await {
                                    warn!(identity, err = %e, "dispatch failed");
                                }
                            }
                            Err(e) => {
                                ctx.metrics.inc_malformed_frames();
                                bad_message_count += 1;
                                warn!(identity, err = %e, count = bad_message_count, "malformed frame");
                                if let Some(id) = WireMessage::recognizable_call_id(&text) {
                                    let err = crate::errors::OcppError::new(
                                        crate::errors::OcppErrorCode::FormatViolation,
                                        e.to_string(),
                                    );
                                    let _ = endpoint.send_error(id, &err).await;
                                }
                                let max_bad_messages = ctx.hot.read().await.max_bad_messages;
                                if bad_message_count >= max_bad_messages {
                                    warn!(identity, "too many malformed frames — closing connection");
                                    let _ = sink
                                        .send(WsMessage::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                                            code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Protocol,
                                            reason: "too many malformed frames".into(),
                                        })))
                                        .await;
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        last_activity = TokioInstant::now();
                        ping_deadline = last_activity + liveness.ping_interval;
                        let _ = sink.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_activity = TokioInstant::now();
                        awaiting_pong = false;
                        ping_deadline = last_activity + liveness.ping_interval;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(identity, err = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(text) => {
                        let len = text.len();
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            warn!(identity, err = %e, "send error");
                            break;
                        }
                        mailbox_for_writer.note_sent(len);
                    }
                    None => break,
                }
            }
        }
    }

    // Set regardless of why the loop exited — an in-flight handler racing
    // `context.signal` should see the connection as closing either way.
    conn_cancel.cancel();
    ctx.sessions.remove(&identity).await;
    if let Err(e) = ctx.router.remove_presence(&identity).await {
        warn!(identity, err = %e, "failed to clear cluster presence");
    }
    Ok(())
}
