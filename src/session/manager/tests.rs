use super::*;
use crate::config::{BreakerConfig, DispatchConfig, LimiterConfig};
use crate::context::InMemoryContextStorage;
use crate::resilience::{BreakerRegistry, LimiterRegistry};
use crate::tools::base::{Invocation, ToolAdapter, ToolDescriptor};
use std::sync::Mutex;
use std::time::Duration;

/// Echoes arguments and records the credential it was invoked with.
struct EchoAdapter {
    name: &'static str,
    delay: Duration,
    seen_credential: Mutex<Option<String>>,
}

impl EchoAdapter {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay: Duration::ZERO,
            seen_credential: Mutex::new(None),
        })
    }

    fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay,
            seen_credential: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ToolAdapter for EchoAdapter {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(self.name, "test")
    }

    async fn invoke(&self, call: Invocation<'_>) -> Result<Vec<u8>, MeshError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        *self.seen_credential.lock().unwrap() = call.passthrough.map(ToString::to_string);
        Ok(serde_json::to_vec(&json!({"echo": call.arguments})).unwrap())
    }
}

struct TestClient {
    to_server: mpsc::Sender<String>,
    from_server: mpsc::Receiver<String>,
}

impl TestClient {
    async fn send(&self, message: Value) {
        self.to_server
            .send(serde_json::to_string(&message).unwrap())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Option<RpcMessage> {
        let raw = tokio::time::timeout(Duration::from_secs(2), self.from_server.recv())
            .await
            .ok()??;
        Some(serde_json::from_str(&raw).unwrap())
    }

    /// Send a request and wait for its response, answering server pings
    /// along the way.
    async fn request(&mut self, id: Value, method: &str, params: Value) -> RpcMessage {
        self.send(json!({"jsonrpc": "2.0", "id": id.clone(), "method": method, "params": params}))
            .await;
        self.response_for(&id).await
    }

    async fn response_for(&mut self, id: &Value) -> RpcMessage {
        loop {
            let message = self.recv().await.expect("response before timeout");
            if message.method.as_deref() == Some("ping") {
                if let Some(ping_id) = message.id.clone() {
                    self.send(json!({"jsonrpc": "2.0", "id": ping_id, "result": {"ok": true}}))
                        .await;
                }
                continue;
            }
            if message.id.as_ref() == Some(id) {
                return message;
            }
        }
    }
}

fn test_manager(adapters: Vec<Arc<EchoAdapter>>, config: SessionConfig) -> Arc<SessionManager> {
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
            ..DispatchConfig::default()
        },
    );
    for adapter in adapters {
        registry.register(adapter).unwrap();
    }

    let contexts = Arc::new(ContextManager::new(Arc::new(InMemoryContextStorage::new())));
    SessionManager::new(
        SessionDirectory::new(),
        Arc::new(registry),
        contexts,
        EventBus::new(),
        config,
    )
}

fn quiet_config() -> SessionConfig {
    SessionConfig {
        host_id: "test-host".into(),
        ping_interval_secs: 300,
        shutdown_grace_secs: 1,
        ..SessionConfig::default()
    }
}

fn connect(manager: &Arc<SessionManager>) -> (TestClient, Arc<Session>) {
    let (to_server, incoming) = mpsc::channel(16);
    let (outgoing, from_server) = mpsc::channel(16);
    let session = manager.accept(SessionTransport { incoming, outgoing });
    (
        TestClient {
            to_server,
            from_server,
        },
        session,
    )
}

async fn handshake(client: &mut TestClient) -> Value {
    let response = client
        .request(
            json!("init-1"),
            "initialize",
            json!({
                "protocolVersion": "2025-06-01",
                "clientInfo": {"name": "test-ide", "version": "1.0"},
                "credentialFingerprint": "sha256:test",
                "passthroughAuth": {"github": "ghp_test_token"}
            }),
        )
        .await;
    response.result.expect("initialize succeeds")
}

#[tokio::test]
async fn handshake_transitions_to_ready_with_derived_agent_id() {
    let manager = test_manager(vec![EchoAdapter::new("echo")], quiet_config());
    let (mut client, session) = connect(&manager);
    assert_eq!(session.state(), SessionState::Handshaking);

    let result = handshake(&mut client).await;
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(
        result["agent_id"].as_str().unwrap(),
        derive_agent_id("sha256:test", "test-host")
    );
    assert_eq!(result["serverCapabilities"]["tools"]["execute"], true);

    // A reconnect with the same credential resolves to the same agent.
    let (mut client2, _session2) = connect(&manager);
    let result2 = handshake(&mut client2).await;
    assert_eq!(result["agent_id"], result2["agent_id"]);
}

#[tokio::test]
async fn second_initialize_is_rejected() {
    let manager = test_manager(vec![EchoAdapter::new("echo")], quiet_config());
    let (mut client, _session) = connect(&manager);
    handshake(&mut client).await;

    let response = client
        .request(json!("init-2"), "initialize", json!({"protocolVersion": "x"}))
        .await;
    assert!(response.error.is_some());
}

#[tokio::test]
async fn tool_calls_require_ready() {
    let manager = test_manager(vec![EchoAdapter::new("echo")], quiet_config());
    let (mut client, _session) = connect(&manager);

    let response = client
        .request(json!(1), "tool.execute", json!({"name": "echo"}))
        .await;
    let error = response.error.unwrap();
    assert!(error.message.contains("Handshaking"));
}

#[tokio::test]
async fn ping_works_before_handshake() {
    let manager = test_manager(vec![], quiet_config());
    let (mut client, _session) = connect(&manager);

    let response = client.request(json!(1), "ping", json!({})).await;
    assert_eq!(response.result.unwrap()["ok"], true);
}

#[tokio::test]
async fn unknown_method_is_32601() {
    let manager = test_manager(vec![], quiet_config());
    let (mut client, _session) = connect(&manager);

    let response = client.request(json!(1), "tool.frobnicate", json!({})).await;
    assert_eq!(response.error.unwrap().code, -32601);
}

#[tokio::test]
async fn malformed_frame_gets_parse_error() {
    let manager = test_manager(vec![], quiet_config());
    let (mut client, _session) = connect(&manager);

    client
        .to_server
        .send("this is not json".to_string())
        .await
        .unwrap();
    let message = client.recv().await.unwrap();
    assert_eq!(message.error.unwrap().code, PARSE_ERROR);
}

#[tokio::test]
async fn execute_returns_text_content_and_session_stays_ready() {
    let adapter = EchoAdapter::new("echo");
    let manager = test_manager(vec![adapter.clone()], quiet_config());
    let (mut client, session) = connect(&manager);
    handshake(&mut client).await;

    let response = client
        .request(
            json!("exec-1"),
            "tool.execute",
            json!({"name": "echo", "action": "say", "arguments": {"msg": "hello"}}),
        )
        .await;
    let result = response.result.unwrap();
    assert_eq!(result["content"][0]["type"], "text");
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(!text.is_empty());
    assert!(text.contains("hello"));
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn tools_call_alias_works() {
    let manager = test_manager(vec![EchoAdapter::new("echo")], quiet_config());
    let (mut client, _session) = connect(&manager);
    handshake(&mut client).await;

    let response = client
        .request(json!(7), "tools/call", json!({"name": "echo", "arguments": {}}))
        .await;
    assert!(response.result.is_some());
}

#[tokio::test]
async fn session_passthrough_reaches_adapter() {
    let adapter = EchoAdapter::new("github_tool");
    let manager = test_manager(vec![adapter.clone()], quiet_config());
    let (mut client, _session) = connect(&manager);
    handshake(&mut client).await;

    // Family credential from the handshake: adapters in category "test"
    // don't match "github", so update with an exact-name credential.
    client
        .request(
            json!("cred-1"),
            "session.update_credentials",
            json!({"passthroughAuth": {"github_tool": "tok-123"}}),
        )
        .await;

    client
        .request(json!("exec-2"), "tool.execute", json!({"name": "github_tool"}))
        .await;
    assert_eq!(
        adapter.seen_credential.lock().unwrap().as_deref(),
        Some("tok-123")
    );
}

#[tokio::test]
async fn per_call_credential_overrides_session() {
    let adapter = EchoAdapter::new("echo");
    let manager = test_manager(vec![adapter.clone()], quiet_config());
    let (mut client, _session) = connect(&manager);
    handshake(&mut client).await;

    client
        .request(
            json!(9),
            "tool.execute",
            json!({"name": "echo", "passthroughAuth": "override-cred"}),
        )
        .await;
    assert_eq!(
        adapter.seen_credential.lock().unwrap().as_deref(),
        Some("override-cred")
    );
}

#[tokio::test]
async fn duplicate_outstanding_id_rejected() {
    let manager = test_manager(
        vec![EchoAdapter::slow("slow", Duration::from_millis(300))],
        quiet_config(),
    );
    let (mut client, _session) = connect(&manager);
    handshake(&mut client).await;

    // Two requests with the same id while the first is in flight.
    client
        .send(json!({"jsonrpc": "2.0", "id": "dup", "method": "tool.execute",
                     "params": {"name": "slow"}}))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .send(json!({"jsonrpc": "2.0", "id": "dup", "method": "tool.execute",
                     "params": {"name": "slow"}}))
        .await;

    // First frame back is the duplicate rejection, then the real result.
    let first = client.response_for(&json!("dup")).await;
    assert_eq!(first.error.unwrap().code, -32600);
    let second = client.response_for(&json!("dup")).await;
    assert!(second.result.is_some());

    // The id is reusable once delivered.
    let reuse = client
        .request(json!("dup"), "tool.execute", json!({"name": "slow"}))
        .await;
    assert!(reuse.result.is_some());
}

#[tokio::test]
async fn context_round_trip_over_rpc() {
    let manager = test_manager(vec![], quiet_config());
    let (mut client, session) = connect(&manager);
    let init = handshake(&mut client).await;

    let response = client
        .request(
            json!(1),
            "context.update",
            json!({"context": {"cursor": {"line": 10}}, "merge": true}),
        )
        .await;
    assert_eq!(response.result.unwrap()["ok"], true);

    let response = client.request(json!(2), "context.get", json!({})).await;
    let context = response.result.unwrap();
    assert_eq!(context["cursor"]["line"], 10);
    assert_eq!(context["agent_id"], init["agent_id"]);
    assert_eq!(
        context["session_id"].as_str().unwrap(),
        session.session_id.to_string()
    );
}

#[tokio::test]
async fn batch_over_rpc_reports_partial_failure() {
    let manager = test_manager(
        vec![
            EchoAdapter::new("github_list_repositories"),
            EchoAdapter::new("agent_list"),
        ],
        quiet_config(),
    );
    let (mut client, _session) = connect(&manager);
    handshake(&mut client).await;

    let response = client
        .request(
            json!("batch-1"),
            "tool.batch",
            json!({
                "tools": [
                    {"id": "valid-1", "name": "github_list_repositories", "arguments": {"type": "owner"}},
                    {"id": "invalid", "name": "nonexistent_tool", "arguments": {}},
                    {"id": "valid-2", "name": "agent_list", "arguments": {}}
                ],
                "parallel": true
            }),
        )
        .await;

    let result = response.result.unwrap();
    assert_eq!(result["success_count"], 2);
    assert_eq!(result["error_count"], 1);
    assert_eq!(result["parallel"], true);
    assert_eq!(result["results"][0]["id"], "valid-1");
    assert_eq!(result["results"][1]["id"], "invalid");
    assert_eq!(result["results"][2]["id"], "valid-2");
}

#[tokio::test]
async fn shutdown_drains_and_closes() {
    let manager = test_manager(vec![], quiet_config());
    let (mut client, session) = connect(&manager);
    handshake(&mut client).await;
    assert_eq!(manager.directory().len(), 1);

    let response = client.request(json!("bye"), "shutdown", json!({})).await;
    assert_eq!(response.result.unwrap()["ok"], true);

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while session.state() != SessionState::Closed {
        assert!(std::time::Instant::now() < deadline, "session never closed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(manager.directory().is_empty());
}

#[tokio::test]
async fn peer_disconnect_closes_session() {
    let manager = test_manager(vec![], quiet_config());
    let (client, session) = connect(&manager);

    drop(client);
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while session.state() != SessionState::Closed {
        assert!(std::time::Instant::now() < deadline, "session never closed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn missed_pongs_close_the_session() {
    let config = SessionConfig {
        host_id: "test-host".into(),
        ping_interval_secs: 1,
        max_missed_pongs: 2,
        ..SessionConfig::default()
    };
    let manager = test_manager(vec![], config);
    let (mut client, session) = connect(&manager);
    handshake(&mut client).await;

    // Never answer pings: after two missed pongs the session closes.
    let deadline = std::time::Instant::now() + Duration::from_secs(8);
    while session.state() != SessionState::Closed {
        assert!(
            std::time::Instant::now() < deadline,
            "liveness did not close the session"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(manager.directory().is_empty());
}

#[tokio::test]
async fn directory_lists_ready_agents() {
    let manager = test_manager(vec![], quiet_config());
    let (mut client, _session) = connect(&manager);
    // Handshaking sessions are not listed.
    assert!(manager.directory().list_agents().await.is_empty());

    let init = handshake(&mut client).await;
    let agents = manager.directory().list_agents().await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_id, init["agent_id"].as_str().unwrap());
}
