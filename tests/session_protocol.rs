mod common;

use base64::Engine;
use common::{ScriptedTool, bare_registry};
use devmesh::bus::EventBus;
use devmesh::config::SessionConfig;
use devmesh::context::{ContextManager, InMemoryContextStorage};
use devmesh::session::{
    RpcMessage, SessionDirectory, SessionManager, SessionState, SessionTransport,
};
use devmesh::tools::ToolRegistry;
use devmesh::tools::agent::AgentAdapter;
use devmesh::tools::github::GithubAdapter;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Client {
    to_server: mpsc::Sender<String>,
    from_server: mpsc::Receiver<String>,
}

impl Client {
    async fn request(&mut self, id: Value, method: &str, params: Value) -> RpcMessage {
        let frame =
            json!({"jsonrpc": "2.0", "id": id.clone(), "method": method, "params": params});
        self.to_server
            .send(serde_json::to_string(&frame).unwrap())
            .await
            .unwrap();
        loop {
            let raw = tokio::time::timeout(Duration::from_secs(5), self.from_server.recv())
                .await
                .expect("response before timeout")
                .expect("channel open");
            let message: RpcMessage = serde_json::from_str(&raw).unwrap();
            if message.method.is_some() {
                // Server-initiated traffic (pings) — not awaited here.
                continue;
            }
            if message.id.as_ref() == Some(&id) {
                return message;
            }
        }
    }
}

fn session_manager(registry: ToolRegistry) -> Arc<SessionManager> {
    let contexts = Arc::new(ContextManager::new(Arc::new(InMemoryContextStorage::new())));
    SessionManager::new(
        SessionDirectory::new(),
        Arc::new(registry),
        contexts,
        EventBus::new(),
        SessionConfig {
            host_id: "it-host".into(),
            ping_interval_secs: 300,
            ..SessionConfig::default()
        },
    )
}

fn connect(manager: &Arc<SessionManager>) -> (Client, Arc<devmesh::session::Session>) {
    let (to_server, incoming) = mpsc::channel(16);
    let (outgoing, from_server) = mpsc::channel(16);
    let session = manager.accept(SessionTransport { incoming, outgoing });
    (
        Client {
            to_server,
            from_server,
        },
        session,
    )
}

#[tokio::test]
async fn happy_single_call_against_github() {
    // A mock code host serving README content the GitHub way.
    let server = MockServer::start().await;
    let readme = "# The Go Programming Language\n\nGo is an open source language.\n";
    Mock::given(method("GET"))
        .and(path("/repos/golang/go/contents/README.md"))
        .and(header("Authorization", "Bearer ghp_passthrough"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "README.md",
            "encoding": "base64",
            "content": base64::engine::general_purpose::STANDARD.encode(readme),
        })))
        .mount(&server)
        .await;

    let mut registry = bare_registry(vec![]);
    registry
        .register(Arc::new(GithubAdapter::new(Some(server.uri()))))
        .unwrap();
    let manager = session_manager(registry);
    let (mut client, session) = connect(&manager);

    // initialize, then tool.execute with a passthrough token.
    let init = client
        .request(
            json!("init"),
            "initialize",
            json!({
                "protocolVersion": "2025-06-01",
                "clientInfo": {"name": "ide", "version": "0.9"},
                "credentialFingerprint": "sha256:dev-laptop",
                "passthroughAuth": {"github": "ghp_passthrough"}
            }),
        )
        .await;
    assert!(init.result.is_some());

    let response = client
        .request(
            json!("exec"),
            "tool.execute",
            json!({
                "name": "github",
                "action": "repos/get-content",
                "arguments": {"owner": "golang", "repo": "go", "path": "README.md"}
            }),
        )
        .await;

    let result = response.result.expect("execute succeeds");
    assert_eq!(result["content"][0]["type"], "text");
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(!text.is_empty());
    assert!(text.contains("Go Programming Language"));
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn list_then_describe_then_execute() {
    let tool = ScriptedTool::new("ci_status", "ci");
    let mut registry =
        bare_registry(vec![tool.clone() as Arc<dyn devmesh::tools::ToolAdapter>]);
    registry
        .register(Arc::new(AgentAdapter::new(Arc::new(SessionDirectory::new()))))
        .unwrap();
    let manager = session_manager(registry);
    let (mut client, _session) = connect(&manager);

    client
        .request(
            json!(0),
            "initialize",
            json!({"protocolVersion": "2025-06-01", "clientInfo": {"name": "ide"}}),
        )
        .await;

    // Discovery: list all, then filter by category.
    let all = client.request(json!(1), "tool.list", json!({})).await;
    let tools = all.result.unwrap();
    let names: Vec<&str> = tools["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["agent", "ci_status"]);

    let filtered = client
        .request(
            json!(2),
            "tool.list",
            json!({"filter": {"categories": ["ci"]}}),
        )
        .await;
    let tools = filtered.result.unwrap();
    assert_eq!(tools["tools"].as_array().unwrap().len(), 1);

    // Execute by uuid taken from the listing.
    let tool_id = tools["tools"][0]["tool_id"].as_str().unwrap().to_string();
    let response = client
        .request(
            json!(3),
            "tool.execute",
            json!({"toolId": tool_id, "arguments": {}}),
        )
        .await;
    assert!(response.result.is_some());
    assert_eq!(tool.invocations(), 1);
}

#[tokio::test]
async fn rate_limit_error_surfaces_retry_after_code_429() {
    use devmesh::config::{BreakerConfig, DispatchConfig, LimiterConfig};
    use devmesh::resilience::{BreakerRegistry, LimiterRegistry};

    // One token, zero wait: the second call must fail with 429.
    let limiters = Arc::new(LimiterRegistry::new(LimiterConfig {
        rate: 1,
        burst: 1,
        wait_limit_ms: Some(0),
    }));
    let mut registry = ToolRegistry::new(
        limiters,
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        EventBus::new(),
        DispatchConfig::default(),
    );
    let tool = ScriptedTool::new("tight", "throttled");
    registry.register(tool).unwrap();
    let manager = session_manager(registry);
    let (mut client, _session) = connect(&manager);

    client
        .request(
            json!(0),
            "initialize",
            json!({"protocolVersion": "2025-06-01", "clientInfo": {"name": "ide"}}),
        )
        .await;

    let first = client
        .request(json!(1), "tool.execute", json!({"name": "tight"}))
        .await;
    assert!(first.result.is_some());

    let second = client
        .request(json!(2), "tool.execute", json!({"name": "tight"}))
        .await;
    let error = second.error.unwrap();
    assert_eq!(error.code, 429);
    assert!(error.data.unwrap()["retry_after"].as_u64().is_some());
}
