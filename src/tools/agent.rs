use crate::MeshError;
use crate::tools::base::{Invocation, ToolAdapter, ToolDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// A connected agent as reported by the session layer.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub session_id: Uuid,
    pub tenant_id: String,
    pub last_seen: DateTime<Utc>,
}

/// Read-only view of live sessions, implemented by the session manager.
/// Kept as a trait so this adapter has no dependency on session internals.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn list_agents(&self) -> Vec<AgentInfo>;
}

/// Local introspection tool: lists agents currently connected to the
/// gateway. No passthrough credential required.
pub struct AgentAdapter {
    directory: Arc<dyn AgentDirectory>,
    descriptor: ToolDescriptor,
}

impl AgentAdapter {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self {
            directory,
            descriptor: ToolDescriptor::new("agent", "internal")
                .with_description("Gateway introspection: list connected agents")
                .with_tags(["introspection"]),
        }
    }
}

#[async_trait]
impl ToolAdapter for AgentAdapter {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, call: Invocation<'_>) -> Result<Vec<u8>, MeshError> {
        match call.action {
            "list" | "" => {
                let agents = self.directory.list_agents().await;
                let count = agents.len();
                serde_json::to_vec(&json!({"agents": agents, "count": count}))
                    .map_err(|e| MeshError::Internal(e.into()))
            }
            other => Err(MeshError::InvalidArguments(format!(
                "unsupported agent action '{}'",
                other
            ))),
        }
    }
}
