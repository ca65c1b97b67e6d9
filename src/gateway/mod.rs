//! HTTP server for the gateway: health, the WebSocket session channel,
//! and the per-source webhook receiver endpoints.

use crate::session::{SessionManager, SessionTransport};
use crate::webhook::{WebhookState, build_router as webhook_router};
use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::{any, get};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Frame buffering between a WebSocket and its session tasks.
const BRIDGE_CAPACITY: usize = 64;

/// Build the full gateway router.
pub fn build_router(sessions: Arc<SessionManager>, webhooks: WebhookState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/ws", any(ws_handler))
        .with_state(sessions)
        .merge(webhook_router(webhooks))
}

/// GET /api/health: liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

/// GET /api/ws: upgrade to the bidirectional session channel.
async fn ws_handler(
    State(sessions): State<Arc<SessionManager>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge_socket(socket, sessions))
}

/// Pump frames between the socket and the session's transport seam. The
/// session side never sees WebSocket details.
async fn bridge_socket(socket: WebSocket, sessions: Arc<SessionManager>) {
    let (to_server, incoming) = mpsc::channel::<String>(BRIDGE_CAPACITY);
    let (outgoing, mut from_server) = mpsc::channel::<String>(BRIDGE_CAPACITY);
    let session = sessions.accept(SessionTransport { incoming, outgoing });
    debug!("ws: bridged session {}", session.session_id);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if to_server.send(text.to_string()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                // Transport-level ping/pong and binary frames are not part
                // of the session protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("ws: socket error on {}: {}", session.session_id, e);
                    break;
                }
            },
            out = from_server.recv() => match out {
                Some(raw) => {
                    if sink.send(WsMessage::Text(raw.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!("ws: bridge for {} ended", session.session_id);
}

/// Bind and serve. Returns the join handle and the bound address (useful
/// when port 0 was requested).
pub async fn start(
    host: &str,
    port: u16,
    router: Router,
) -> Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
    let addr = listener.local_addr()?;
    info!("gateway listening on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("gateway server error: {}", e);
        }
    });
    Ok((handle, addr))
}
