pub mod batch;
pub mod manager;
pub mod rpc;

pub use batch::{BatchExecutor, BatchItem, BatchRequest, BatchResult, ToolOutcome};
pub use manager::{SessionDirectory, SessionManager, SessionTransport};
pub use rpc::{Method, RpcError, RpcMessage};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{MeshError, MeshResult};

/// Session lifecycle. `tool.*` and `context.*` require Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Identity established at handshake.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub agent_id: String,
    pub tenant_id: String,
    pub capabilities: HashSet<String>,
}

/// Deterministic agent identity: the same credential fingerprint on the
/// same host resolves to the same agent across reconnects. Never minted
/// per connection.
pub fn derive_agent_id(credential_fingerprint: &str, host_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential_fingerprint.as_bytes());
    hasher.update(b":");
    hasher.update(host_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("agent-{}", &digest[..16])
}

/// One authenticated client channel. Holds connection-scoped state only:
/// identity, passthrough credentials, request correlation. Owned by the
/// [`manager::SessionManager`].
pub struct Session {
    pub session_id: Uuid,
    state: Mutex<SessionState>,
    identity: Mutex<Option<SessionIdentity>>,
    /// tool family -> opaque downstream credential. Single writer (the
    /// session's own request handling), many readers via snapshot. Never
    /// persisted, never logged.
    passthrough: RwLock<HashMap<String, String>>,
    /// Client request ids currently being served (duplicate detection).
    outstanding: Mutex<HashSet<String>>,
    /// Correlation slots for server-initiated requests (liveness pings).
    server_pending: Mutex<HashMap<String, oneshot::Sender<RpcMessage>>>,
    last_seen: Mutex<DateTime<Utc>>,
    outbound: mpsc::Sender<RpcMessage>,
    drained: Notify,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(outbound: mpsc::Sender<RpcMessage>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            session_id: Uuid::new_v4(),
            state: Mutex::new(SessionState::Handshaking),
            identity: Mutex::new(None),
            passthrough: RwLock::new(HashMap::new()),
            outstanding: Mutex::new(HashSet::new()),
            server_pending: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Utc::now()),
            outbound,
            drained: Notify::new(),
            closed_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Closed is terminal.
        if *state == SessionState::Closed {
            return;
        }
        debug!("session {}: {:?} -> {:?}", self.session_id, *state, next);
        *state = next;
        if next == SessionState::Closed {
            self.closed_tx.send(true).ok();
        }
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_identity(&self, identity: SessionIdentity) {
        *self
            .identity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(identity);
    }

    pub fn agent_id(&self) -> Option<String> {
        self.identity().map(|i| i.agent_id)
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Utc::now();
    }

    /// Lightweight read snapshot for dispatch.
    pub fn passthrough_snapshot(&self) -> HashMap<String, String> {
        self.passthrough
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Merge-in credentials (handshake or `session.update_credentials`).
    pub(crate) fn update_passthrough(&self, credentials: HashMap<String, String>) {
        let mut passthrough = self
            .passthrough
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        passthrough.extend(credentials);
    }

    /// Claim a client request id. Duplicate while the original is
    /// outstanding is an input error; ids become reusable after the
    /// response is delivered.
    pub(crate) fn begin_request(&self, id: &str) -> MeshResult<()> {
        let mut outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !outstanding.insert(id.to_string()) {
            return Err(MeshError::DuplicateId(id.to_string()));
        }
        Ok(())
    }

    pub(crate) fn finish_request(&self, id: &str) {
        let mut outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        outstanding.remove(id);
        if outstanding.is_empty() {
            self.drained.notify_waiters();
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Wait until all outstanding requests have completed, bounded by
    /// `deadline`. Returns false on timeout.
    pub(crate) async fn wait_drained(&self, deadline: std::time::Duration) -> bool {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            // Register interest before checking so a finish_request racing
            // this check cannot be missed.
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(end, notified).await.is_err() {
                return self.outstanding_count() == 0;
            }
        }
    }

    pub(crate) async fn send(&self, message: RpcMessage) -> MeshResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| MeshError::Session("channel closed".into()))
    }

    /// Register a correlation slot for a server-initiated request.
    pub(crate) fn register_server_request(&self, id: &str) -> oneshot::Receiver<RpcMessage> {
        let (tx, rx) = oneshot::channel();
        self.server_pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.to_string(), tx);
        rx
    }

    /// Route a client response to its slot. Unknown ids are logged and
    /// dropped.
    pub(crate) fn resolve_server_response(&self, message: RpcMessage) {
        let Some(id) = message.id.as_ref().map(correlation_key) else {
            warn!("session {}: response without id dropped", self.session_id);
            return;
        };
        let slot = self
            .server_pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
        match slot {
            Some(tx) => {
                tx.send(message).ok();
            }
            None => {
                warn!(
                    "session {}: response with unknown id {} dropped",
                    self.session_id, id
                );
            }
        }
    }
}

/// Canonical string form of a JSON-RPC id for correlation maps.
pub(crate) fn correlation_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
