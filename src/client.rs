// SPDX-License-Identifier: MIT
//! Client role: connects outbound to a central system and maintains the
//! connection across drops with jittered reconnect backoff.
//!
//! Mirrors the shape of this codebase's own outbound relay client — one
//! background task that connects, splits the stream, and races an inbound
//! handler against an outbound drain loop inside `select!` — but trades the
//! relay's E2E handshake and multiplicative backoff for OCPP-J framing and
//! the proportional jitter formula in [`crate::retry::reconnect_jitter_delay`].

use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_tungstenite::{connect_async_with_config, tungstenite::protocol::WebSocketConfig, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::endpoint::{dispatch_inbound, ActionHandler, CallOptions, Endpoint, HandlerContext};
use crate::errors::RpcError;
use crate::queue::{CallQueue, OfflineCall, OfflineQueue, OutboundMailbox};
use crate::retry::reconnect_jitter_delay;
use crate::wire::Message as WireMessage;
use crate::ServerContext;

/// Connection lifecycle state, mirroring the wire contract's `CONNECTING` /
/// `OPEN` / `CLOSING` / `CLOSED` states. Gates whether [`ClientHandle::call`]
/// sends directly or falls back to the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct ClientState {
    state: RwLock<ConnectionState>,
    endpoint: RwLock<Option<Arc<Endpoint>>>,
    offline_queue: Mutex<OfflineQueue>,
}

/// Shared handle to one client connection's lifecycle, usable to issue
/// outbound calls from outside the reconnect loop.
///
/// `call` sends immediately when the connection is `OPEN`; otherwise, if the
/// offline queue is enabled (`offlineQueueMaxSize > 0`), it enqueues and
/// awaits the flush that happens on the next successful reconnect.
#[derive(Clone)]
pub struct ClientHandle(Arc<ClientState>);

impl ClientHandle {
    fn new(offline_queue_max_size: usize) -> Self {
        Self(Arc::new(ClientState {
            state: RwLock::new(ConnectionState::Closed),
            endpoint: RwLock::new(None),
            offline_queue: Mutex::new(OfflineQueue::new(offline_queue_max_size)),
        }))
    }

    pub async fn state(&self) -> ConnectionState {
        *self.0.state.read().await
    }

    /// Number of calls currently held in the offline queue, awaiting a
    /// reconnect to flush them.
    pub async fn offline_queue_len(&self) -> usize {
        self.0.offline_queue.lock().await.len()
    }

    /// Issue a CALL, either directly (connection `OPEN`) or via the offline
    /// queue, per the wire contract: "Only legal when state is OPEN unless
    /// offlineQueue is enabled."
    pub async fn call(&self, action: &str, payload: serde_json::Value, options: CallOptions) -> Result<serde_json::Value, RpcError> {
        let open_endpoint = {
            let state = self.0.state.read().await;
            if *state == ConnectionState::Open {
                self.0.endpoint.read().await.clone()
            } else {
                None
            }
        };

        if let Some(endpoint) = open_endpoint {
            return endpoint.call(action, payload, options).await;
        }

        let (tx, rx) = oneshot::channel();
        let queued = self.0.offline_queue.lock().await.push(OfflineCall {
            action: action.to_string(),
            payload,
            idempotency_key: options.idempotency_key,
            responder: tx,
        });
        if !queued {
            return Err(RpcError::Disconnected);
        }
        rx.await.map_err(|_| RpcError::Disconnected)?
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.0.state.write().await = state;
    }

    async fn set_endpoint(&self, endpoint: Option<Arc<Endpoint>>) {
        *self.0.endpoint.write().await = endpoint;
    }

    /// Resend every offline-queued call through `endpoint`, FIFO, each as
    /// an independent task so a slow or failing flush entry doesn't block
    /// the rest or the caller of this function.
    async fn flush_offline_queue(&self, endpoint: &Arc<Endpoint>) {
        let queued = self.0.offline_queue.lock().await.drain();
        if queued.is_empty() {
            return;
        }
        debug!(count = queued.len(), "flushing offline call queue after reconnect");
        for call in queued {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let result = endpoint
                    .call(
                        &call.action,
                        call.payload,
                        CallOptions {
                            idempotency_key: call.idempotency_key,
                            ..Default::default()
                        },
                    )
                    .await;
                let _ = call.responder.send(result);
            });
        }
    }
}

/// Connect to `url` and run the reconnect loop in the background,
/// returning immediately with a [`ClientHandle`] for issuing calls and the
/// driving future to await (typically via `tokio::spawn`).
pub fn connect(
    url: String,
    identity: String,
    ctx: Arc<ServerContext>,
    handler: Arc<dyn ActionHandler>,
) -> (ClientHandle, impl std::future::Future<Output = Result<()>>) {
    let handle = ClientHandle::new(ctx.config.offline_queue_max_size);
    let driver = run_loop(url, identity, ctx, handler, handle.clone());
    (handle, driver)
}

/// Connect to `url` (typically `wss://host/ocpp/<identity>`) and run the
/// reconnect loop until the process shuts down. Returns only if `ctx`'s
/// node is torn down; connection drops are retried internally.
///
/// Convenience wrapper over [`connect`] for callers that don't need to
/// issue outbound calls (e.g. the `ocppjd connect` CLI subcommand, which
/// only echoes `NotImplemented` back to the central system).
pub async fn run(url: String, identity: String, ctx: Arc<ServerContext>, handler: Arc<dyn ActionHandler>) -> Result<()> {
    let (_handle, driver) = connect(url, identity, ctx, handler);
    driver.await
}

async fn run_loop(
    url: String,
    identity: String,
    ctx: Arc<ServerContext>,
    handler: Arc<dyn ActionHandler>,
    handle: ClientHandle,
) -> Result<()> {
    let mut attempt: u32 = 0;

    loop {
        if ctx.shutdown.is_cancelled() {
            info!(identity, "client: shutdown signaled — not reconnecting");
            return Ok(());
        }

        handle.set_state(ConnectionState::Connecting).await;
        info!(url = %url, identity, "client: connecting");
        ctx.metrics.inc_reconnect_attempts();

        let ws_config = WebSocketConfig {
            max_message_size: Some(ctx.config.max_payload_bytes),
            max_frame_size: Some(ctx.config.max_payload_bytes),
            ..Default::default()
        };

        match connect_async_with_config(&url, Some(ws_config), false).await {
            Ok((ws, response)) => {
                info!(identity, "client: connected");
                attempt = 0;

                let negotiated_subprotocol = response
                    .headers()
                    .get("Sec-WebSocket-Protocol")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());

                let (mut sink, mut stream) = ws.split();
                let (mailbox, mut outbound_rx) =
                    OutboundMailbox::new_with_threshold(256, ctx.config.backpressure_threshold_bytes);
                let mailbox_for_writer = mailbox.clone();

                ctx.sessions.insert(&identity, Some(url.clone()), mailbox.clone()).await;
                if let Err(e) = ctx.router.set_presence(&identity, ctx.config.cluster.presence_ttl).await {
                    warn!(identity, err = %e, "failed to assert cluster presence");
                }

                let breaker = crate::circuit_breaker::CircuitBreaker::new(
                    format!("client-{identity}"),
                    crate::circuit_breaker::CircuitBreakerConfig::default(),
                );
                let endpoint = Arc::new(Endpoint::with_validators(
                    mailbox,
                    CallQueue::new(ctx.config.max_in_flight_calls),
                    breaker,
                    ctx.metrics.clone(),
                    ctx.config.call_timeout,
                    ctx.config.strict_mode.then(|| ctx.validators.clone()),
                ));

                ctx.sessions.attach_endpoint(&identity, endpoint.clone()).await;
                handle.set_endpoint(Some(endpoint.clone())).await;
                handle.set_state(ConnectionState::Open).await;
                handle.flush_offline_queue(&endpoint).await;

                let conn_cancel = ctx.shutdown.child_token();

                run_connection(
                    &mut stream,
                    &mut sink,
                    &mut outbound_rx,
                    &mailbox_for_writer,
                    &endpoint,
                    handler.clone(),
                    &identity,
                    &ctx,
                    negotiated_subprotocol.as_deref(),
                    &conn_cancel,
                )
                .await;

                conn_cancel.cancel();
                handle.set_state(ConnectionState::Closed).await;
                handle.set_endpoint(None).await;
                ctx.sessions.remove(&identity).await;
                if let Err(e) = ctx.router.remove_presence(&identity).await {
                    warn!(identity, err = %e, "failed to clear cluster presence");
                }
            }
            Err(e) => {
                handle.set_state(ConnectionState::Closed).await;
                warn!(identity, err = %e, "client: connection failed");
            }
        }

        attempt += 1;
        let delay = reconnect_jitter_delay(ctx.config.reconnect_backoff_min, ctx.config.reconnect_backoff_max, attempt);
        debug!(identity, attempt, delay_ms = delay.as_millis(), "client: reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
}

/// Drive one connection's inbound dispatch, outbound drain, and ping/pong
/// liveness side by side until either direction closes. Mirrors
/// `server::run_session`'s merged select loop — the client role needs the
/// same liveness contract as the server role, just with this endpoint
/// sending pings to the central system instead of the other way around.
#[allow(clippy::too_many_arguments)]
async fn run_connection(
    stream: &mut (impl StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin),
    sink: &mut (impl SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    rx: &mut tokio::sync::mpsc::Receiver<String>,
    mailbox: &OutboundMailbox,
    endpoint: &Arc<Endpoint>,
    handler: Arc<dyn ActionHandler>,
    identity: &str,
    ctx: &Arc<ServerContext>,
    protocol: Option<&str>,
    conn_cancel: &tokio_util::sync::CancellationToken,
) {
    use tokio::time::{sleep_until, Instant as TokioInstant};

    let liveness = ctx.config.liveness.clone();
    let mut last_activity = TokioInstant::now();
    let mut awaiting_pong = false;
    let mut ping_deadline = last_activity + liveness.ping_interval;

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => {
                debug!(identity, "client: shutdown signaled — closing connection");
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            _ = sleep_until(ping_deadline) => {
                if awaiting_pong {
                    ctx.metrics.inc_pong_timeouts();
                    warn!(identity, "client: pong not received within timeout — closing connection");
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
                        match WireMessage::parse(&text) {
                            Ok(wire_msg) => {
                                if matches!(wire_msg, WireMessage::Call { .. }) {
                                    ctx.metrics.inc_calls_received();
                                }
                                let context = HandlerContext { signal: conn_cancel.clone() };
                                if let Err(e) = dispatch_inbound(endpoint, handler.as_ref(), protocol, wire_msg, context).await {
                                    warn!(identity, err = %e, "client: dispatch failed");
                                }
                            }
                            Err(e) => {
                                ctx.metrics.inc_malformed_frames();
                                warn!(identity, err = %e, "client: malformed frame from remote");
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
                        warn!(identity, err = %e, "client: stream error");
                        break;
                    }
                    _ => {}
                }
            }
            frame = rx.recv() => {
                match frame {
                    Some(text) => {
                        let len = text.len();
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                        mailbox.note_sent(len);
                    }
                    None => break,
                }
            }
        }
    }
}
