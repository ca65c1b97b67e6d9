use crate::MeshError;
use crate::tools::base::{Invocation, ToolAdapter, ToolDescriptor};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub type WebhookHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, MeshError>> + Send + Sync>;

/// Internal dispatch target for the webhook worker. Actions are
/// `{source}/{event_type}`; arguments are the stored webhook event record.
/// Handlers are registered at startup; `{source}/*` acts as a per-source
/// fallback. Events with no handler are acknowledged and logged; receipt
/// was already recorded upstream.
pub struct WebhookDispatchAdapter {
    handlers: HashMap<String, WebhookHandler>,
    descriptor: ToolDescriptor,
}

impl WebhookDispatchAdapter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            descriptor: ToolDescriptor::new("webhook", "internal")
                .with_description("Internal webhook event processing")
                .with_tags(["pipeline"]),
        }
    }

    /// Register a handler for `{source}/{event_type}` (or `{source}/*`).
    pub fn route<F>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, MeshError>> + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    fn lookup(&self, action: &str) -> Option<&WebhookHandler> {
        if let Some(handler) = self.handlers.get(action) {
            return Some(handler);
        }
        let source = action.split('/').next()?;
        self.handlers.get(&format!("{}/*", source))
    }
}

impl Default for WebhookDispatchAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for WebhookDispatchAdapter {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, call: Invocation<'_>) -> Result<Vec<u8>, MeshError> {
        match self.lookup(call.action) {
            Some(handler) => {
                let outcome = handler(call.arguments.clone()).await?;
                serde_json::to_vec(&json!({"handled": true, "outcome": outcome}))
                    .map_err(|e| MeshError::Internal(e.into()))
            }
            None => {
                debug!("webhook event '{}' has no handler — acknowledged", call.action);
                serde_json::to_vec(&json!({"handled": false}))
                    .map_err(|e| MeshError::Internal(e.into()))
            }
        }
    }
}
