pub mod receiver;

pub use receiver::{WebhookState, build_router};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authentication context attached to a webhook delivery as it travels the
/// pipeline. Carries identity only, never downstream credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub tenant_id: String,
    pub principal: String,
    pub permissions: Vec<String>,
}

/// One upstream webhook delivery, uniquely identified by `delivery_id`.
/// This is the record enqueued for the workers and embedded in retry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub delivery_id: String,
    pub source: String,
    pub event_type: String,
    pub repo_name: Option<String>,
    pub sender_name: Option<String>,
    pub payload: Value,
    pub auth: AuthContext,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Dispatch action for the internal webhook tool.
    pub fn action(&self) -> String {
        format!("{}/{}", self.source, self.event_type)
    }
}
