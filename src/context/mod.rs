use crate::{MeshError, MeshResult};
use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Fields owned by the server; client updates can never overwrite them.
pub const MANAGED_FIELDS: &[&str] = &["agent_id", "session_id", "model_id"];

pub type ContextData = HashMap<String, Value>;

/// Persistence port for session contexts (database or object store in
/// production). Implementations must be safe for concurrent use.
#[async_trait]
pub trait ContextStorage: Send + Sync {
    async fn load(&self, session_id: Uuid) -> anyhow::Result<Option<ContextData>>;
    async fn store(&self, session_id: Uuid, data: &ContextData) -> anyhow::Result<()>;
    async fn delete(&self, session_id: Uuid) -> anyhow::Result<()>;
}

/// In-memory storage used by tests and the default binary wiring.
#[derive(Default)]
pub struct InMemoryContextStorage {
    data: StdMutex<HashMap<Uuid, ContextData>>,
}

impl InMemoryContextStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStorage for InMemoryContextStorage {
    async fn load(&self, session_id: Uuid) -> anyhow::Result<Option<ContextData>> {
        Ok(self
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&session_id)
            .cloned())
    }

    async fn store(&self, session_id: Uuid, data: &ContextData) -> anyhow::Result<()> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session_id, data.clone());
        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> anyhow::Result<()> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&session_id);
        Ok(())
    }
}

/// Per-session structured context with merge/replace semantics. Mutations
/// are serialized per session; reads go through a bounded L1 cache that is
/// invalidated before the persistent write completes, and cache misses
/// reload under the same per-session lock, so a concurrent read never
/// observes (or resurrects) stale data after an acknowledged write.
pub struct ContextManager {
    storage: Arc<dyn ContextStorage>,
    cache: StdMutex<LruCache<Uuid, ContextData>>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ContextManager {
    pub fn new(storage: Arc<dyn ContextStorage>) -> Self {
        Self::with_capacity(storage, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(storage: Arc<dyn ContextStorage>, capacity: usize) -> Self {
        Self {
            storage,
            cache: StdMutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
            )),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn session_lock(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(session_id).or_default().clone()
    }

    /// Seed the server-managed fields when a session reaches Ready.
    pub async fn init(
        &self,
        session_id: Uuid,
        agent_id: &str,
        model_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut data = ContextData::new();
        data.insert("agent_id".into(), Value::String(agent_id.to_string()));
        data.insert("session_id".into(), Value::String(session_id.to_string()));
        data.insert(
            "model_id".into(),
            model_id.map_or(Value::Null, |m| Value::String(m.to_string())),
        );

        self.invalidate(session_id);
        self.storage.store(session_id, &data).await
    }

    pub async fn get(&self, session_id: Uuid) -> MeshResult<ContextData> {
        if let Some(data) = self.cached(session_id) {
            return Ok(data);
        }

        // Load and repopulate under the per-session lock so a concurrent
        // update's invalidate-then-store cannot interleave with the load
        // and leave a stale entry behind an acknowledged write. Double-check
        // the cache once the lock is held, in case another reader filled it.
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        if let Some(data) = self.cached(session_id) {
            return Ok(data);
        }
        let data = self
            .storage
            .load(session_id)
            .await?
            .ok_or_else(|| MeshError::ContextNotFound(session_id.to_string()))?;

        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.put(session_id, data.clone());
        Ok(data)
    }

    fn cached(&self, session_id: Uuid) -> Option<ContextData> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }

    /// `merge = true` upserts the provided top-level keys; `merge = false`
    /// replaces the whole mapping. Server-managed fields survive either way.
    pub async fn update(&self, session_id: Uuid, data: ContextData, merge: bool) -> MeshResult<()> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let current = self
            .storage
            .load(session_id)
            .await?
            .ok_or_else(|| MeshError::ContextNotFound(session_id.to_string()))?;

        let mut next = if merge {
            current.clone()
        } else {
            current
                .iter()
                .filter(|(k, _)| MANAGED_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, value) in data {
            if !MANAGED_FIELDS.contains(&key.as_str()) {
                next.insert(key, value);
            }
        }

        // Invalidate first: a read racing this write either sees the old
        // committed state or reloads after the store, never a stale cache
        // entry surviving the acknowledgement.
        self.invalidate(session_id);
        self.storage.store(session_id, &next).await?;
        Ok(())
    }

    pub async fn replace(&self, session_id: Uuid, data: ContextData) -> MeshResult<()> {
        self.update(session_id, data, false).await
    }

    /// Drop all state for a closed session.
    pub async fn remove(&self, session_id: Uuid) -> anyhow::Result<()> {
        let lock = self.session_lock(session_id).await;
        {
            let _guard = lock.lock().await;
            self.invalidate(session_id);
            self.storage.delete(session_id).await?;
        }
        self.locks.lock().await.remove(&session_id);
        Ok(())
    }

    fn invalidate(&self, session_id: Uuid) {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop(&session_id);
    }
}
