#![allow(dead_code)]

use async_trait::async_trait;
use devmesh::MeshError;
use devmesh::bus::EventBus;
use devmesh::config::{BreakerConfig, DispatchConfig, LimiterConfig, WebhookSourceConfig};
use devmesh::resilience::{BreakerRegistry, LimiterRegistry};
use devmesh::tools::base::{Invocation, ToolAdapter, ToolDescriptor};
use devmesh::tools::ToolRegistry;
use devmesh::webhook::{AuthContext, WebhookEvent};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WEBHOOK_SECRET: &str = "integration-secret";

/// Adapter playing back scripted outcomes; repeats the last outcome (or
/// success) once the script is exhausted.
pub struct ScriptedTool {
    descriptor: ToolDescriptor,
    script: Mutex<VecDeque<Result<Vec<u8>, MeshError>>>,
    pub invocations: AtomicU32,
    pub seen_credential: Mutex<Option<String>>,
}

impl ScriptedTool {
    pub fn new(name: &str, category: &str) -> Arc<Self> {
        Self::scripted(ToolDescriptor::new(name, category), vec![])
    }

    pub fn scripted(
        descriptor: ToolDescriptor,
        script: Vec<Result<Vec<u8>, MeshError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            script: Mutex::new(script.into()),
            invocations: AtomicU32::new(0),
            seen_credential: Mutex::new(None),
        })
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolAdapter for ScriptedTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, call: Invocation<'_>) -> Result<Vec<u8>, MeshError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        *self.seen_credential.lock().unwrap() = call.passthrough.map(ToString::to_string);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(b"ok".to_vec()))
    }
}

/// Registry with generous limits and no in-call retry, suitable for
/// deterministic assertions.
pub fn bare_registry(adapters: Vec<Arc<dyn ToolAdapter>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new(
        Arc::new(LimiterRegistry::new(LimiterConfig {
            rate: 1000,
            burst: 1000,
            wait_limit_ms: Some(1000),
        })),
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        EventBus::new(),
        DispatchConfig {
            retry_max: 0,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            ..DispatchConfig::default()
        },
    );
    for adapter in adapters {
        registry.register(adapter).unwrap();
    }
    registry
}

/// Webhook source config matching the integration secret and allowlist.
pub fn github_source(allowed: &[&str]) -> WebhookSourceConfig {
    WebhookSourceConfig {
        secret: Some(WEBHOOK_SECRET.to_string()),
        allowed_events: allowed.iter().map(ToString::to_string).collect(),
        ..WebhookSourceConfig::default()
    }
}

pub fn sign_body(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn webhook_event(delivery_id: &str, event_type: &str) -> WebhookEvent {
    WebhookEvent {
        delivery_id: delivery_id.to_string(),
        source: "github".into(),
        event_type: event_type.to_string(),
        repo_name: Some("golang/go".into()),
        sender_name: Some("gopher".into()),
        payload: json!({"ref": "refs/heads/main"}),
        auth: AuthContext {
            tenant_id: "default".into(),
            principal: "webhook:github".into(),
            permissions: vec![],
        },
        received_at: chrono::Utc::now(),
    }
}

/// Poll until `check` passes or the deadline elapses.
pub async fn eventually<F>(deadline: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let end = std::time::Instant::now() + deadline;
    loop {
        if check() {
            return;
        }
        assert!(
            std::time::Instant::now() < end,
            "condition not met within {:?}",
            deadline
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Convenience: JSON value from adapter result bytes.
pub fn as_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}
