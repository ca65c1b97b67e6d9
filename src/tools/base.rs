use crate::MeshError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Immutable description of a registered tool. The registry is frozen after
/// startup; descriptors are reloaded out-of-band by restarting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub tool_id: Uuid,
    pub name: String,
    pub category: String,
    pub description: String,
    pub tags: HashSet<String>,
    /// JSON Schema the dispatcher validates arguments against.
    pub input_schema: Value,
    pub enabled: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            tool_id: Uuid::new_v4(),
            name: name.into(),
            category: category.into(),
            description: String::new(),
            tags: HashSet::new(),
            input_schema: serde_json::json!({"type": "object"}),
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_schema(mut self, input_schema: Value) -> Self {
        self.input_schema = input_schema;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// One adapter invocation. `passthrough` is the caller's downstream
/// credential for this tool family. Never persisted, never logged.
pub struct Invocation<'a> {
    pub action: &'a str,
    pub arguments: &'a Value,
    pub passthrough: Option<&'a str>,
    pub deadline: Duration,
}

/// A concrete implementation of a tool speaking to one external service.
/// Adapters return opaque result bytes; structured errors carry the kind
/// the dispatcher classifies on.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn invoke(&self, call: Invocation<'_>) -> Result<Vec<u8>, MeshError>;
}

/// Filter for `tool.list`: category membership, tag intersection, and name
/// substring all AND together. Empty filter matches everything enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolFilter {
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub name_contains: Option<String>,
}

impl ToolFilter {
    pub fn matches(&self, descriptor: &ToolDescriptor) -> bool {
        if !descriptor.enabled {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&descriptor.category) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| descriptor.tags.contains(t)) {
            return false;
        }
        if let Some(needle) = &self.name_contains {
            if !descriptor.name.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}
