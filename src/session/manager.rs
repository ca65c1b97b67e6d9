use crate::bus::{BusEvent, EventBus};
use crate::config::SessionConfig;
use crate::context::{ContextData, ContextManager};
use crate::session::batch::{BatchExecutor, BatchRequest};
use crate::session::rpc::{
    ContextUpdateParams, ExecuteParams, InitializeParams, Method, PARSE_ERROR, RpcMessage,
    UpdateCredentialsParams,
};
use crate::session::{
    Session, SessionIdentity, SessionState, correlation_key, derive_agent_id,
};
use crate::tools::agent::{AgentDirectory, AgentInfo};
use crate::tools::{ToolFilter, ToolRegistry};
use crate::{MeshError, MeshResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Channel capacity for per-session outbound frames.
const OUTBOUND_CAPACITY: usize = 64;

/// The two halves of an accepted bidirectional channel, as seen by the
/// server: frames in, frames out. The gateway bridges WebSocket traffic
/// onto this seam; tests drive it directly.
pub struct SessionTransport {
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
}

/// Live-session index shared between the session manager and the `agent`
/// introspection tool. Keeping it separate breaks the construction cycle
/// between the tool registry and the manager.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session.session_id, session);
    }

    fn remove(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&session_id)
    }

    pub fn get(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AgentDirectory for SessionDirectory {
    async fn list_agents(&self) -> Vec<AgentInfo> {
        let sessions: Vec<Arc<Session>> = {
            self.sessions
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .values()
                .cloned()
                .collect()
        };
        sessions
            .into_iter()
            .filter(|s| s.state() == SessionState::Ready)
            .filter_map(|s| {
                s.identity().map(|identity| AgentInfo {
                    agent_id: identity.agent_id,
                    session_id: s.session_id,
                    tenant_id: identity.tenant_id,
                    last_seen: s.last_seen(),
                })
            })
            .collect()
    }
}

/// Owns session lifecycles: accepts channels, spawns the per-connection
/// reader/writer/liveness tasks, routes JSON-RPC requests into the
/// dispatcher, batch executor, and context manager. Cheap to clone; the
/// per-connection tasks each carry their own clone.
#[derive(Clone)]
pub struct SessionManager {
    directory: SessionDirectory,
    registry: Arc<ToolRegistry>,
    contexts: Arc<ContextManager>,
    bus: Arc<EventBus>,
    batch: BatchExecutor,
    config: SessionConfig,
    host_id: String,
}

impl SessionManager {
    pub fn new(
        directory: SessionDirectory,
        registry: Arc<ToolRegistry>,
        contexts: Arc<ContextManager>,
        bus: Arc<EventBus>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let host_id = if config.host_id.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
        } else {
            config.host_id.clone()
        };
        let batch = BatchExecutor::new(config.max_parallel_batch, config.batch_deadline());
        Arc::new(Self {
            directory,
            registry,
            contexts,
            bus,
            batch,
            config,
            host_id,
        })
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    /// Accept a channel: create the session and spawn its reader, writer,
    /// and liveness tasks.
    pub fn accept(&self, transport: SessionTransport) -> Arc<Session> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<RpcMessage>(OUTBOUND_CAPACITY);
        let session = Arc::new(Session::new(outbound_tx));
        self.directory.insert(session.clone());
        info!("session {}: accepted", session.session_id);

        // Writer task: the single point where frames leave the session.
        {
            let outgoing = transport.outgoing;
            let mut closed = session.closed_signal();
            let session_id = session.session_id;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = closed.changed() => {
                            // Flush frames already queued (e.g. the shutdown
                            // response) before tearing down.
                            while let Ok(message) = outbound_rx.try_recv() {
                                let Ok(raw) = serde_json::to_string(&message) else {
                                    continue;
                                };
                                if outgoing.send(raw).await.is_err() {
                                    break;
                                }
                            }
                            break;
                        }
                        next = outbound_rx.recv() => match next {
                            Some(message) => {
                                let raw = match serde_json::to_string(&message) {
                                    Ok(raw) => raw,
                                    Err(e) => {
                                        error!("session {}: encode failed: {}", session_id, e);
                                        continue;
                                    }
                                };
                                if outgoing.send(raw).await.is_err() {
                                    debug!("session {}: peer went away", session_id);
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }

        // Reader task: frames in, requests fanned out to their own tasks.
        {
            let manager = self.clone();
            let session = session.clone();
            let mut incoming = transport.incoming;
            let mut closed = session.closed_signal();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = closed.changed() => break,
                        next = incoming.recv() => match next {
                            Some(raw) => manager.handle_frame(&session, raw).await,
                            None => break,
                        },
                    }
                }
                manager.close_session(&session).await;
            });
        }

        // Liveness task: ping/pong with bounded missed-pong tolerance.
        {
            let manager = self.clone();
            let session = session.clone();
            tokio::spawn(async move { manager.liveness_loop(session).await });
        }

        session
    }

    async fn handle_frame(&self, session: &Arc<Session>, raw: String) {
        session.touch();
        let message: RpcMessage = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(e) => {
                debug!("session {}: unparseable frame: {}", session.session_id, e);
                session
                    .send(RpcMessage::protocol_error(None, PARSE_ERROR, "parse error"))
                    .await
                    .ok();
                return;
            }
        };

        if message.is_response() {
            session.resolve_server_response(message);
            return;
        }

        let Some(method) = message.method.clone() else {
            debug!("session {}: frame with no method dropped", session.session_id);
            return;
        };
        let params = message.params.clone().unwrap_or_else(|| json!({}));

        match message.id {
            None => self.handle_notification(session, &method).await,
            Some(id) => {
                // Each request runs in its own task so a slow tool call
                // never blocks the reader.
                let manager = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    manager.handle_request(&session, id, &method, params).await;
                });
            }
        }
    }

    async fn handle_notification(&self, session: &Arc<Session>, method: &str) {
        match Method::parse(method) {
            Some(Method::Initialized) => {
                // Acknowledged but does not gate state.
                info!("session {}: client initialized", session.session_id);
            }
            _ => {
                debug!(
                    "session {}: notification '{}' ignored",
                    session.session_id, method
                );
            }
        }
    }

    async fn handle_request(
        &self,
        session: &Arc<Session>,
        id: Value,
        method: &str,
        params: Value,
    ) {
        let key = correlation_key(&id);
        if let Err(e) = session.begin_request(&key) {
            session
                .send(RpcMessage::error_response(Some(id), &e))
                .await
                .ok();
            return;
        }

        let result = self.dispatch(session, method, params).await;
        let response = match result {
            Ok(value) => RpcMessage::response(id, value),
            Err(err) => {
                if matches!(err, MeshError::Internal(_)) {
                    error!(
                        "session {}: internal error on {}: {}",
                        session.session_id, method, err
                    );
                }
                RpcMessage::error_response(Some(id), &err)
            }
        };
        session.send(response).await.ok();
        session.finish_request(&key);
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        method: &str,
        params: Value,
    ) -> MeshResult<Value> {
        let method = Method::parse(method)
            .ok_or_else(|| MeshError::UnknownMethod(method.to_string()))?;

        if method.requires_ready() && session.state() != SessionState::Ready {
            return Err(MeshError::Session(format!(
                "session is {:?}, not Ready",
                session.state()
            )));
        }

        match method {
            Method::Initialize => self.handle_initialize(session, params).await,
            // `initialized` as a request (some clients do) is just acked.
            Method::Initialized => Ok(json!({})),
            Method::Ping => Ok(json!({"ok": true})),
            Method::ToolList => {
                let filter: ToolFilter = match params.get("filter") {
                    Some(filter) => serde_json::from_value(filter.clone())
                        .map_err(|e| MeshError::InvalidArguments(e.to_string()))?,
                    None => ToolFilter::default(),
                };
                Ok(json!({"tools": self.registry.list(&filter)}))
            }
            Method::ToolExecute => self.handle_execute(session, params).await,
            Method::ToolBatch => {
                let request: BatchRequest = serde_json::from_value(params)
                    .map_err(|e| MeshError::InvalidArguments(e.to_string()))?;
                let result = self
                    .batch
                    .execute(&self.registry, &session.passthrough_snapshot(), request)
                    .await?;
                serde_json::to_value(result).map_err(|e| MeshError::Internal(e.into()))
            }
            Method::ContextGet => {
                let context = self.contexts.get(session.session_id).await?;
                serde_json::to_value(context).map_err(|e| MeshError::Internal(e.into()))
            }
            Method::ContextUpdate => {
                let update: ContextUpdateParams = serde_json::from_value(params)
                    .map_err(|e| MeshError::InvalidArguments(e.to_string()))?;
                let data: ContextData = update.context.into_iter().collect();
                self.contexts
                    .update(session.session_id, data, update.merge)
                    .await?;
                Ok(json!({"ok": true}))
            }
            Method::UpdateCredentials => {
                let update: UpdateCredentialsParams = serde_json::from_value(params)
                    .map_err(|e| MeshError::InvalidArguments(e.to_string()))?;
                session.update_passthrough(update.passthrough_auth);
                Ok(json!({"ok": true}))
            }
            Method::Shutdown => {
                session.set_state(SessionState::Closing);
                let manager = self.clone();
                let session = session.clone();
                let grace = self.config.shutdown_grace();
                tokio::spawn(async move {
                    if !session.wait_drained(grace).await {
                        warn!(
                            "session {}: shutdown grace elapsed with {} request(s) outstanding",
                            session.session_id,
                            session.outstanding_count()
                        );
                    }
                    manager.close_session(&session).await;
                });
                Ok(json!({"ok": true}))
            }
        }
    }

    async fn handle_initialize(
        &self,
        session: &Arc<Session>,
        params: Value,
    ) -> MeshResult<Value> {
        if session.state() != SessionState::Handshaking {
            return Err(MeshError::Session("session already initialized".into()));
        }
        let params: InitializeParams = serde_json::from_value(params)
            .map_err(|e| MeshError::InvalidArguments(e.to_string()))?;

        // agent_id is derived, never minted: same credential + host means
        // the same agent across reconnects.
        let fingerprint = params
            .credential_fingerprint
            .unwrap_or_else(|| format!("client:{}", params.client_info.name));
        let agent_id = derive_agent_id(&fingerprint, &self.host_id);
        let tenant_id = params.tenant_id.unwrap_or_else(|| "default".to_string());

        session.set_identity(SessionIdentity {
            agent_id: agent_id.clone(),
            tenant_id,
            capabilities: params.capabilities.into_iter().collect(),
        });
        session.update_passthrough(params.passthrough_auth);

        self.contexts
            .init(session.session_id, &agent_id, None)
            .await
            .map_err(MeshError::Internal)?;

        session.set_state(SessionState::Ready);
        self.bus.emit_detached(
            BusEvent::SessionOpened {
                session_id: session.session_id,
                agent_id: agent_id.clone(),
            },
            None,
        );

        Ok(json!({
            "protocolVersion": crate::PROTOCOL_VERSION,
            "serverCapabilities": {
                "tools": {"list": true, "execute": true, "batch": true},
                "context": true,
                "ping": true,
            },
            "agent_id": agent_id,
            "session_id": session.session_id,
        }))
    }

    async fn handle_execute(&self, session: &Arc<Session>, params: Value) -> MeshResult<Value> {
        let params: ExecuteParams = serde_json::from_value(params)
            .map_err(|e| MeshError::InvalidArguments(e.to_string()))?;
        let selector = params
            .selector()
            .ok_or_else(|| MeshError::InvalidArguments("missing tool selector".into()))?;

        // Per-call credential beats the session mapping; the session
        // mapping is keyed by tool name, then tool family.
        let credential = match params.passthrough_auth.clone() {
            Some(credential) => Some(credential),
            None => {
                let snapshot = session.passthrough_snapshot();
                snapshot.get(selector).cloned().or_else(|| {
                    self.registry
                        .describe(selector)
                        .ok()
                        .and_then(|d| {
                            snapshot
                                .get(&d.name)
                                .or_else(|| snapshot.get(&d.category))
                                .cloned()
                        })
                })
            }
        };

        let bytes = self
            .registry
            .execute(
                selector,
                &params.action,
                &params.arguments,
                credential.as_deref(),
                None,
            )
            .await?;

        Ok(json!({
            "content": [{
                "type": "text",
                "text": String::from_utf8_lossy(&bytes).into_owned(),
            }]
        }))
    }

    async fn liveness_loop(&self, session: Arc<Session>) {
        let interval = self.config.ping_interval();
        let mut closed = session.closed_signal();
        let mut missed = 0u32;
        let mut seq = 0u64;

        loop {
            tokio::select! {
                _ = closed.changed() => break,
                () = tokio::time::sleep(interval) => {}
            }
            if session.state() == SessionState::Closed {
                break;
            }

            seq += 1;
            let ping_id = format!("srv-ping-{}", seq);
            let pong = session.register_server_request(&ping_id);
            if session
                .send(RpcMessage::request(json!(ping_id), "ping", json!({})))
                .await
                .is_err()
            {
                break;
            }

            match tokio::time::timeout(interval, pong).await {
                Ok(Ok(_)) => {
                    missed = 0;
                    session.touch();
                }
                _ => {
                    missed += 1;
                    warn!(
                        "session {}: missed pong {}/{}",
                        session.session_id, missed, self.config.max_missed_pongs
                    );
                    if missed >= self.config.max_missed_pongs {
                        session.set_state(SessionState::Closing);
                        self.close_session(&session).await;
                        break;
                    }
                }
            }
        }
    }

    /// Idempotent teardown: drop the session from the directory, release
    /// its context, and notify observers.
    pub async fn close_session(&self, session: &Arc<Session>) {
        let removed = self.directory.remove(session.session_id);
        session.set_state(SessionState::Closed);
        if removed.is_some() {
            if let Err(e) = self.contexts.remove(session.session_id).await {
                warn!(
                    "session {}: context cleanup failed: {}",
                    session.session_id, e
                );
            }
            self.bus.emit_detached(
                BusEvent::SessionClosed {
                    session_id: session.session_id,
                },
                None,
            );
            info!("session {}: closed", session.session_id);
        }
    }
}

#[cfg(test)]
mod tests;
