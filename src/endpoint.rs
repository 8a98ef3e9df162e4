// SPDX-License-Identifier: MIT
//! The RPC endpoint: one instance per connection, pairing outbound
//! CALLs with their eventual CALLRESULT/CALLERROR via a pending-call table
//! keyed by message id, and dispatching inbound CALLs to a caller-supplied
//! action handler.
//!
//! The pending-call table follows the same `oneshot`-per-request shape as a
//! reconnecting RPC client queuing ops against a background driver task:
//! each call reserves a slot with a `oneshot::Sender`, hands the `Receiver`
//! back to the caller, and the task that eventually sees the matching
//! response id fires the sender.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::errors::{OcppError, RpcError};
use crate::metrics::SharedMetrics;
use crate::queue::{CallQueue, OutboundMailbox};
use crate::retry::full_jitter_delay;
use crate::validator::{SchemaKind, ValidatorRegistry};
use crate::wire::Message;

/// Cancellation context handed to an inbound handler invocation. `signal`
/// is set (observable via `.cancelled()`) when the connection is closing or
/// the server is shutting down, letting a long-running handler body bail
/// out early instead of racing a socket that's already gone.
#[derive(Clone, Default)]
pub struct HandlerContext {
    pub signal: CancellationToken,
}

/// Implemented by callers to handle inbound CALLs addressed to this
/// endpoint's action namespace.
///
/// Returns `Ok(Some(payload))` for a normal CALLRESULT, `Ok(None)` for the
/// NOREPLY sentinel (no response frame is sent at all), or an `OcppError`
/// to be sent back as a CALLERROR. `protocol` is the negotiated subprotocol
/// for this connection, if any, so implementations can key dispatch by
/// `protocol:method` the way [`crate::handler_registry::HandlerRegistry`]
/// does.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        protocol: Option<&str>,
        action: &str,
        payload: serde_json::Value,
        context: HandlerContext,
    ) -> Result<Option<serde_json::Value>, OcppError>;
}

struct PendingCall {
    responder: oneshot::Sender<Result<serde_json::Value, OcppError>>,
}

/// Options accepted by [`Endpoint::call`], mirroring the wire contract's
/// `{timeoutMs, retries, retryDelayMs, retryMaxDelayMs, idempotencyKey}`.
/// `timeoutMs` is fixed per-endpoint (`call_timeout`) rather than
/// per-call, matching how this crate configures it.
#[derive(Clone, Debug)]
pub struct CallOptions {
    /// Caller-supplied message id. When set, retries of this same logical
    /// call reuse it so a peer that already processed it can recognize the
    /// duplicate. When `None`, a fresh opaque id is generated once and
    /// reused across any retries of this call.
    pub idempotency_key: Option<String>,
    /// Additional attempts after the first on timeout.
    pub retries: u32,
    pub retry_delay: Duration,
    pub retry_max_delay: Duration,
    /// Cancels this call (and any retries of it) immediately, removing the
    /// pending entry without waiting for `call_timeout`. Checked alongside
    /// the response and the timeout on every attempt.
    pub signal: Option<CancellationToken>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            idempotency_key: None,
            retries: 0,
            retry_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(30),
            signal: None,
        }
    }
}

/// Per-connection RPC endpoint: owns the outbound call queue, the pending
/// response table, and the mailbox frames are written through.
pub struct Endpoint {
    mailbox: OutboundMailbox,
    pending: Mutex<HashMap<String, PendingCall>>,
    /// Ids of inbound CALLs whose handler is currently running, so a
    /// duplicate id arriving before the first completes is rejected rather
    /// than dispatched twice.
    pending_responses: Mutex<HashSet<String>>,
    queue: CallQueue,
    breaker: CircuitBreaker,
    metrics: SharedMetrics,
    call_timeout: Duration,
    /// Strict-mode schema validator, present only when `strict_mode` is
    /// enabled. `None` makes every `validate` call below a no-op, so this
    /// endpoint behaves identically to a non-strict one without an `if`
    /// at every call site.
    validators: Option<Arc<ValidatorRegistry>>,
}

impl Endpoint {
    pub fn new(
        mailbox: OutboundMailbox,
        queue: CallQueue,
        breaker: CircuitBreaker,
        metrics: SharedMetrics,
        call_timeout: Duration,
    ) -> Self {
        Self::with_validators(mailbox, queue, breaker, metrics, call_timeout, None)
    }

    pub fn with_validators(
        mailbox: OutboundMailbox,
        queue: CallQueue,
        breaker: CircuitBreaker,
        metrics: SharedMetrics,
        call_timeout: Duration,
        validators: Option<Arc<ValidatorRegistry>>,
    ) -> Self {
        Self {
            mailbox,
            pending: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashSet::new()),
            queue,
            breaker,
            metrics,
            call_timeout,
            validators,
        }
    }

    /// Issue an outbound CALL and await its matching CALLRESULT/CALLERROR,
    /// retrying with full-jitter backoff on timeout per `options.retries`.
    ///
    /// The message id is `options.idempotency_key` if set, otherwise a
    /// fresh opaque id generated once and reused across any retries — a
    /// peer that already processed an earlier attempt can recognize the
    /// duplicate by id. Blocks on the outbound queue until a concurrency
    /// slot is free, then writes the frame and waits up to `call_timeout`
    /// for a response delivered via [`Endpoint::resolve`]. Respects the
    /// circuit breaker — fails fast with [`RpcError::Disconnected`] rather
    /// than enqueuing a call the breaker believes will fail.
    pub async fn call(&self, action: &str, payload: serde_json::Value, options: CallOptions) -> Result<serde_json::Value, RpcError> {
        if let Some(validators) = &self.validators {
            validators
                .validate(action, SchemaKind::Request, &payload)
                .map_err(RpcError::Remote)?;
        }

        let id = options
            .idempotency_key
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut last_err = None;
        for attempt in 0..=options.retries {
            if let Some(signal) = &options.signal {
                if signal.is_cancelled() {
                    return Err(RpcError::Cancelled);
                }
            }
            match self.call_once(id.clone(), action, payload.clone(), options.signal.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(RpcError::Timeout(_)) if attempt < options.retries => {
                    let delay = full_jitter_delay(options.retry_delay, options.retry_max_delay, attempt);
                    warn!(action, id, attempt, delay_ms = delay.as_millis(), "call timed out — retrying");
                    tokio::time::sleep(delay).await;
                    last_err = Some(RpcError::Timeout(options.retry_delay));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(RpcError::Disconnected))
    }

    /// One attempt of a CALL/response round trip, with no retry logic —
    /// the unit [`Endpoint::call`] retries. `signal`, if cancelled before a
    /// response arrives, removes the pending entry and resolves immediately
    /// with `RpcError::Cancelled` rather than waiting out `call_timeout`.
    async fn call_once(
        &self,
        id: String,
        action: &str,
        payload: serde_json::Value,
        signal: Option<&CancellationToken>,
    ) -> Result<serde_json::Value, RpcError> {
        if !self.breaker.is_allowed().await {
            return Err(RpcError::Disconnected);
        }

        let _slot = self.queue.acquire().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), PendingCall { responder: tx });
        }

        let message = Message::call(id.clone(), action.to_string(), payload);
        if let Err(e) = self.mailbox.send(message.to_wire_string()).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        self.metrics.inc_calls_sent();

        let outcome = match signal {
            Some(signal) => {
                tokio::select! {
                    result = tokio::time::timeout(self.call_timeout, rx) => Ok(result),
                    _ = signal.cancelled() => Err(()),
                }
            }
            None => Ok(tokio::time::timeout(self.call_timeout, rx).await),
        };

        let result = match outcome {
            Err(()) => {
                self.pending.lock().await.remove(&id);
                self.breaker.record_failure().await;
                return Err(RpcError::Cancelled);
            }
            Ok(result) => result,
        };

        match result {
            Ok(Ok(Ok(value))) => {
                self.breaker.record_success().await;
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                self.breaker.record_failure().await;
                Err(RpcError::Remote(err))
            }
            Ok(Err(_recv_cancelled)) => {
                self.breaker.record_failure().await;
                Err(RpcError::Disconnected)
            }
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                self.breaker.record_failure().await;
                self.metrics.inc_call_timeouts();
                Err(RpcError::Timeout(self.call_timeout))
            }
        }
    }

    /// Deliver a CALLRESULT/CALLERROR that just arrived to whichever
    /// pending call it resolves. No-op (with a warning) if no call with
    /// that id is outstanding — either it already timed out, or the remote
    /// sent a response to an id it was never asked about.
    pub async fn resolve(&self, id: &str, result: Result<serde_json::Value, OcppError>) {
        let pending = self.pending.lock().await.remove(id);
        match pending {
            Some(PendingCall { responder }) => {
                let _ = responder.send(result);
            }
            None => {
                warn!(id, "response for unknown or already-timed-out call id");
            }
        }
    }

    /// Send a CALLRESULT in response to an inbound CALL.
    pub async fn send_result(&self, id: String, payload: serde_json::Value) -> Result<(), RpcError> {
        let message = Message::call_result(id, payload);
        self.mailbox.send(message.to_wire_string()).await?;
        self.metrics.inc_call_results_sent();
        Ok(())
    }

    /// Send a CALLERROR in response to an inbound CALL.
    pub async fn send_error(&self, id: String, error: &OcppError) -> Result<(), RpcError> {
        let message = Message::call_error_with_details(
            id,
            error.code,
            error.description.clone(),
            error.details.clone(),
        );
        self.mailbox.send(message.to_wire_string()).await?;
        self.metrics.inc_call_errors_sent();
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Issue every `(action, payload, options)` in `calls` concurrently,
    /// temporarily widening the outbound queue to `calls.len()` in-flight
    /// slots so none of them wait behind each other on this endpoint's
    /// usual concurrency limit, then restoring it. A call that errors
    /// contributes `None` at its position rather than failing the batch.
    pub async fn send_batch(
        &self,
        calls: Vec<(String, serde_json::Value, CallOptions)>,
    ) -> Vec<Option<serde_json::Value>> {
        let added = self.queue.raise_to(calls.len());
        let futures = calls
            .into_iter()
            .map(|(action, payload, options)| async move { self.call(&action, payload, options).await.ok() });
        let results = futures_util::future::join_all(futures).await;
        self.queue.restore(added);
        results
    }
}

/// Dispatch one inbound wire message to the appropriate endpoint action:
/// CALLs go to `handler`, CALLRESULT/CALLERROR resolve a pending outbound
/// call on `endpoint`. `protocol` is the connection's negotiated
/// subprotocol, threaded through to the handler for `protocol:method`
/// dispatch.
pub async fn dispatch_inbound(
    endpoint: &Endpoint,
    handler: &dyn ActionHandler,
    protocol: Option<&str>,
    message: Message,
    context: HandlerContext,
) -> Result<(), RpcError> {
    match message {
        Message::Call { id, action, payload } => {
            {
                let mut in_flight = endpoint.pending_responses.lock().await;
                if !in_flight.insert(id.clone()) {
                    trace!(id, action, "duplicate inbound call id while handler still running — ignored");
                    return Ok(());
                }
            }

            if let Some(validators) = &endpoint.validators {
                if let Err(err) = validators.validate(&action, SchemaKind::Request, &payload) {
                    endpoint.pending_responses.lock().await.remove(&id);
                    return endpoint.send_error(id, &err).await;
                }
            }

            let result = handler.handle(protocol, &action, payload, context).await;
            endpoint.pending_responses.lock().await.remove(&id);
            match result {
                Ok(Some(result)) => {
                    if let Some(validators) = &endpoint.validators {
                        if let Err(err) = validators.validate(&action, SchemaKind::Response, &result) {
                            return endpoint.send_error(id, &err).await;
                        }
                    }
                    endpoint.send_result(id, result).await
                }
                Ok(None) => Ok(()), // NOREPLY
                Err(err) => endpoint.send_error(id, &err).await,
            }
        }
        Message::CallResult { id, payload } => {
            endpoint.resolve(&id, Ok(payload)).await;
            Ok(())
        }
        Message::CallError {
            id,
            error_code,
            error_description,
            error_details,
        } => {
            let code = crate::errors::OcppErrorCode::from_wire_str(&error_code);
            let err = OcppError::new(code, error_description).with_details(error_details);
            endpoint.resolve(&id, Err(err)).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::metrics::OcppMetrics;
    use serde_json::json;

    fn test_endpoint() -> (Endpoint, tokio::sync::mpsc::Receiver<String>) {
        let (mailbox, rx) = OutboundMailbox::new(8);
        let endpoint = Endpoint::new(
            mailbox,
            CallQueue::new(4),
            CircuitBreaker::new("test", CircuitBreakerConfig::default()),
            Arc::new(OcppMetrics::new()),
            Duration::from_millis(100),
        );
        (endpoint, rx)
    }

    #[tokio::test]
    async fn call_resolves_on_matching_result() {
        let (endpoint, mut rx) = test_endpoint();
        let endpoint = Arc::new(endpoint);
        let call_endpoint = endpoint.clone();
        let handle = tokio::spawn(async move {
            call_endpoint
                .call(
                    "Heartbeat",
                    json!({}),
                    CallOptions {
                        idempotency_key: Some("1".to_string()),
                        ..Default::default()
                    },
                )
                .await
        });

        let _frame = rx.recv().await.unwrap();
        endpoint.resolve("1", Ok(json!({"currentTime": "now"}))).await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, json!({"currentTime": "now"}));
    }

    #[tokio::test]
    async fn call_times_out_without_a_response() {
        let (endpoint, _rx) = test_endpoint();
        let result = endpoint
            .call(
                "Heartbeat",
                json!({}),
                CallOptions {
                    idempotency_key: Some("2".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(RpcError::Timeout(_))));
    }

    #[tokio::test]
    async fn call_cancelled_via_signal_returns_cancelled_error() {
        let (endpoint, _rx) = test_endpoint();
        let endpoint = Arc::new(endpoint);
        let signal = CancellationToken::new();

        let call_endpoint = endpoint.clone();
        let call_signal = signal.clone();
        let handle = tokio::spawn(async move {
            call_endpoint
                .call(
                    "Heartbeat",
                    json!({}),
                    CallOptions {
                        idempotency_key: Some("cancel-me".to_string()),
                        signal: Some(call_signal),
                        ..Default::default()
                    },
                )
                .await
        });

        // Give the call a moment to register itself as pending before cancelling.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        signal.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn call_with_already_cancelled_signal_fails_immediately() {
        let (endpoint, _rx) = test_endpoint();
        let signal = CancellationToken::new();
        signal.cancel();

        let result = endpoint
            .call(
                "Heartbeat",
                json!({}),
                CallOptions {
                    idempotency_key: Some("already-cancelled".to_string()),
                    signal: Some(signal),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn resolve_with_error_surfaces_as_remote() {
        let (endpoint, mut rx) = test_endpoint();
        let endpoint = Arc::new(endpoint);
        let call_endpoint = endpoint.clone();
        let handle = tokio::spawn(async move {
            call_endpoint
                .call(
                    "Reset",
                    json!({}),
                    CallOptions {
                        idempotency_key: Some("3".to_string()),
                        ..Default::default()
                    },
                )
                .await
        });
        let _frame = rx.recv().await.unwrap();
        endpoint
            .resolve("3", Err(OcppError::not_implemented("Reset")))
            .await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RpcError::Remote(_))));
    }

    #[tokio::test]
    async fn resolve_for_unknown_id_does_not_panic() {
        let (endpoint, _rx) = test_endpoint();
        endpoint.resolve("nonexistent", Ok(json!({}))).await;
    }

    #[tokio::test]
    async fn call_without_idempotency_key_generates_a_fresh_id() {
        let (endpoint, mut rx) = test_endpoint();
        let endpoint = Arc::new(endpoint);
        let call_endpoint = endpoint.clone();
        let handle = tokio::spawn(async move {
            call_endpoint.call("Heartbeat", json!({}), CallOptions::default()).await
        });

        let frame = rx.recv().await.unwrap();
        let sent = Message::parse(&frame).unwrap();
        let id = sent.id().to_string();
        assert!(!id.is_empty());
        endpoint.resolve(&id, Ok(json!({}))).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn retry_reuses_the_same_message_id() {
        let (endpoint, mut rx) = test_endpoint();
        let endpoint = Arc::new(endpoint);
        let call_endpoint = endpoint.clone();
        let handle = tokio::spawn(async move {
            call_endpoint
                .call(
                    "Heartbeat",
                    json!({}),
                    CallOptions {
                        idempotency_key: Some("retry-id".to_string()),
                        retries: 1,
                        retry_delay: Duration::from_millis(1),
                        retry_max_delay: Duration::from_millis(10),
                    },
                )
                .await
        });

        // First attempt times out without a response; the second attempt
        // must carry the same wire id.
        let first_frame = rx.recv().await.unwrap();
        assert_eq!(Message::parse(&first_frame).unwrap().id(), "retry-id");
        let second_frame = rx.recv().await.unwrap();
        assert_eq!(Message::parse(&second_frame).unwrap().id(), "retry-id");

        endpoint.resolve("retry-id", Ok(json!({"ok": true}))).await;
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn send_batch_widens_concurrency_and_restores_it() {
        let (endpoint, mut rx) = test_endpoint();
        let endpoint = Arc::new(endpoint);
        let batch_endpoint = endpoint.clone();
        let handle = tokio::spawn(async move {
            batch_endpoint
                .send_batch(vec![
                    ("A".to_string(), json!({}), CallOptions { idempotency_key: Some("a".into()), ..Default::default() }),
                    ("B".to_string(), json!({}), CallOptions { idempotency_key: Some("b".into()), ..Default::default() }),
                    ("C".to_string(), json!({}), CallOptions { idempotency_key: Some("c".into()), ..Default::default() }),
                ])
                .await
        });

        // All three frames go out without waiting on each other, proving
        // the queue was widened rather than serialized at its default of 4
        // (which would still pass three through, so drain exactly three
        // distinct ids to confirm no call stalled behind another).
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let frame = rx.recv().await.unwrap();
            seen.insert(Message::parse(&frame).unwrap().id().to_string());
        }
        assert_eq!(seen, ["a", "b", "c"].into_iter().map(String::from).collect());

        endpoint.resolve("a", Ok(json!(1))).await;
        endpoint.resolve("b", Err(OcppError::not_implemented("B"))).await;
        endpoint.resolve("c", Ok(json!(3))).await;

        let results = handle.await.unwrap();
        assert_eq!(results, vec![Some(json!(1)), None, Some(json!(3))]);
        assert_eq!(endpoint.queue.capacity(), 4);
    }

    struct EchoHandler;

    #[async_trait]
    impl ActionHandler for EchoHandler {
        async fn handle(
            &self,
            _protocol: Option<&str>,
            _action: &str,
            payload: serde_json::Value,
            _context: HandlerContext,
        ) -> Result<Option<serde_json::Value>, OcppError> {
            Ok(Some(payload))
        }
    }

    fn authorize_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "connectorId": { "type": "integer" },
                "idTag": { "type": "string" }
            },
            "required": ["connectorId", "idTag"]
        })
    }

    fn strict_endpoint() -> (Endpoint, tokio::sync::mpsc::Receiver<String>) {
        let (mailbox, rx) = OutboundMailbox::new(8);
        let validators = ValidatorRegistry::new();
        validators
            .register("RemoteStartTransaction", SchemaKind::Request, &authorize_schema())
            .unwrap();
        let endpoint = Endpoint::with_validators(
            mailbox,
            CallQueue::new(4),
            CircuitBreaker::new("test", CircuitBreakerConfig::default()),
            Arc::new(OcppMetrics::new()),
            Duration::from_millis(100),
            Some(Arc::new(validators)),
        );
        (endpoint, rx)
    }

    #[tokio::test]
    async fn inbound_call_failing_strict_validation_emits_call_error_without_invoking_handler() {
        let (endpoint, mut rx) = strict_endpoint();
        let message = Message::call("1", "RemoteStartTransaction", json!({"connectorId": 1}));
        dispatch_inbound(&endpoint, &EchoHandler, None, message, HandlerContext::default())
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        let response = Message::parse(&frame).unwrap();
        match response {
            Message::CallError { id, error_code, .. } => {
                assert_eq!(id, "1");
                assert_eq!(error_code, crate::errors::OcppErrorCode::OccurrenceConstraintViolation.as_wire_str());
            }
            other => panic!("expected CALLERROR, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_call_passing_strict_validation_reaches_the_handler() {
        let (endpoint, mut rx) = strict_endpoint();
        let payload = json!({"connectorId": 1, "idTag": "ABC123"});
        let message = Message::call("2", "RemoteStartTransaction", payload.clone());
        dispatch_inbound(&endpoint, &EchoHandler, None, message, HandlerContext::default())
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        let response = Message::parse(&frame).unwrap();
        assert_eq!(response, Message::call_result("2", payload));
    }

    #[tokio::test]
    async fn outbound_call_failing_strict_validation_never_reaches_the_wire() {
        let (endpoint, mut rx) = strict_endpoint();
        let result = endpoint
            .call(
                "RemoteStartTransaction",
                json!({"connectorId": 1}),
                CallOptions {
                    idempotency_key: Some("x".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(RpcError::Remote(_))));
        assert!(rx.try_recv().is_err());
    }
}
