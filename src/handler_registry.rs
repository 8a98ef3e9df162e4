// SPDX-License-Identifier: MIT
//! Handler lookup table for inbound CALLs (part of C4).
//!
//! Keys are `(protocol, method)` pairs plus a single wildcard slot. Lookup
//! order on an inbound call is `protocol:method -> method -> wildcard`,
//! falling back to `NotImplemented` if nothing matches — the same tagged
//! lookup table with explicit priority order used elsewhere in this
//! codebase for multi-version dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::endpoint::{ActionHandler, HandlerContext};
use crate::errors::OcppError;

/// A single registered action.
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, payload: Value) -> Result<Option<Value>, OcppError>;
}

#[async_trait]
impl<F, Fut> Action for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Option<Value>, OcppError>> + Send,
{
    async fn call(&self, payload: Value) -> Result<Option<Value>, OcppError> {
        (self)(payload).await
    }
}

/// Tagged dispatch table: `protocol:method` entries take priority over a
/// plain `method` entry, which takes priority over the wildcard handler.
#[derive(Default)]
pub struct HandlerRegistry {
    versioned: RwLock<HashMap<(String, String), Arc<dyn Action>>>,
    by_method: RwLock<HashMap<String, Arc<dyn Action>>>,
    wildcard: RwLock<Option<Arc<dyn Action>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method` under a specific subprotocol only.
    pub async fn register_for_protocol(&self, protocol: impl Into<String>, method: impl Into<String>, action: Arc<dyn Action>) {
        self.versioned
            .write()
            .await
            .insert((protocol.into(), method.into()), action);
    }

    /// Register a handler for `method` regardless of negotiated subprotocol.
    pub async fn register(&self, method: impl Into<String>, action: Arc<dyn Action>) {
        self.by_method.write().await.insert(method.into(), action);
    }

    /// Register the fallback invoked when nothing else matches.
    pub async fn register_wildcard(&self, action: Arc<dyn Action>) {
        *self.wildcard.write().await = Some(action);
    }
}

#[async_trait]
impl ActionHandler for HandlerRegistry {
    async fn handle(&self, protocol: Option<&str>, action: &str, payload: Value, _context: HandlerContext) -> Result<Option<Value>, OcppError> {
        if let Some(protocol) = protocol {
            if let Some(handler) = self
                .versioned
                .read()
                .await
                .get(&(protocol.to_string(), action.to_string()))
                .cloned()
            {
                return handler.call(payload).await;
            }
        }

        if let Some(handler) = self.by_method.read().await.get(action).cloned() {
            return handler.call(payload).await;
        }

        if let Some(handler) = self.wildcard.read().await.clone() {
            return handler.call(payload).await;
        }

        Err(OcppError::not_implemented(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_action(value: Value) -> Arc<dyn Action> {
        Arc::new(move |_payload: Value| {
            let value = value.clone();
            async move { Ok(Some(value)) }
        })
    }

    #[tokio::test]
    async fn falls_back_to_not_implemented_with_no_handlers() {
        let registry = HandlerRegistry::new();
        let err = registry.handle(None, "Heartbeat", json!({}), HandlerContext::default()).await.unwrap_err();
        assert_eq!(err.code, crate::errors::OcppErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn method_handler_is_used_when_no_protocol_match() {
        let registry = HandlerRegistry::new();
        registry.register("Heartbeat", ok_action(json!({"currentTime": "now"}))).await;
        let result = registry
            .handle(Some("ocpp1.6"), "Heartbeat", json!({}), HandlerContext::default())
            .await
            .unwrap();
        assert_eq!(result, Some(json!({"currentTime": "now"})));
    }

    #[tokio::test]
    async fn protocol_specific_handler_wins_over_plain_method() {
        let registry = HandlerRegistry::new();
        registry.register("Heartbeat", ok_action(json!("v-agnostic"))).await;
        registry
            .register_for_protocol("ocpp2.0.1", "Heartbeat", ok_action(json!("v2")))
            .await;

        let v2 = registry.handle(Some("ocpp2.0.1"), "Heartbeat", json!({}), HandlerContext::default()).await.unwrap();
        assert_eq!(v2, Some(json!("v2")));

        let v16 = registry.handle(Some("ocpp1.6"), "Heartbeat", json!({}), HandlerContext::default()).await.unwrap();
        assert_eq!(v16, Some(json!("v-agnostic")));
    }

    #[tokio::test]
    async fn wildcard_is_last_resort() {
        let registry = HandlerRegistry::new();
        registry.register_wildcard(ok_action(json!("caught"))).await;
        let result = registry.handle(None, "Anything", json!({}), HandlerContext::default()).await.unwrap();
        assert_eq!(result, Some(json!("caught")));
    }
}
