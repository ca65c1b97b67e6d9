use crate::MeshError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC parse error code (malformed frame).
pub const PARSE_ERROR: i64 = -32700;

/// One frame on the session channel: request, notification, or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&MeshError> for RpcError {
    fn from(err: &MeshError) -> Self {
        let data = err
            .retry_after()
            .map(|secs| serde_json::json!({"retry_after": secs}));
        Self {
            code: err.protocol_code(),
            message: err.to_string(),
            data,
        }
    }
}

impl RpcMessage {
    pub fn request(id: Value, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Option<Value>, err: &MeshError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(RpcError::from(err)),
        }
    }

    pub fn protocol_error(id: Option<Value>, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }
}

/// Methods the core serves. Both the dotted and slashed aliases are
/// accepted where clients diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Initialized,
    Ping,
    ToolList,
    ToolExecute,
    ToolBatch,
    ContextGet,
    ContextUpdate,
    UpdateCredentials,
    Shutdown,
}

impl Method {
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "initialize" => Some(Self::Initialize),
            "initialized" => Some(Self::Initialized),
            "ping" => Some(Self::Ping),
            "tool.list" | "tools/list" => Some(Self::ToolList),
            "tool.execute" | "tools/call" => Some(Self::ToolExecute),
            "tool.batch" | "tools/batch" => Some(Self::ToolBatch),
            "context.get" => Some(Self::ContextGet),
            "context.update" => Some(Self::ContextUpdate),
            "session.update_credentials" => Some(Self::UpdateCredentials),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Whether the session must be Ready to serve this method.
    pub fn requires_ready(self) -> bool {
        matches!(
            self,
            Self::ToolList
                | Self::ToolExecute
                | Self::ToolBatch
                | Self::ContextGet
                | Self::ContextUpdate
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_info: ClientInfo,
    /// Stable fingerprint of the client's credential; mixed with the host
    /// identifier to derive `agent_id` across reconnects.
    pub credential_fingerprint: Option<String>,
    pub tenant_id: Option<String>,
    pub capabilities: Vec<String>,
    /// Initial passthrough credentials: tool family -> opaque credential.
    pub passthrough_auth: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub tool_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub action: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
    /// Per-call credential override for this tool family.
    pub passthrough_auth: Option<String>,
}

impl ExecuteParams {
    pub fn selector(&self) -> Option<&str> {
        self.tool_id.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdateParams {
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default = "default_merge")]
    pub merge: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCredentialsParams {
    #[serde(default)]
    pub passthrough_auth: HashMap<String, String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_merge() -> bool {
    true
}
