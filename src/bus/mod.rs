pub mod events;

pub use events::BusEvent;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of the detached-dispatch channel. A full channel drops the
/// event with a warning rather than blocking the emitter.
const DETACHED_CAPACITY: usize = 256;

/// Observer of gateway lifecycle events. One signature only: listeners
/// receive the typed event and return a result that is recorded but never
/// stops dispatch.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn handle(&self, event: &BusEvent) -> Result<()>;

    /// Name used in logs when this listener fails.
    fn name(&self) -> &str {
        "listener"
    }
}

/// Handle returned by subscribe; pass to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Registered = (ListenerId, Arc<dyn EventListener>);

struct Registry {
    typed: HashMap<&'static str, Vec<Registered>>,
    global: Vec<Registered>,
}

/// Completion callback for detached emits. Receives the (always-Ok)
/// dispatch outcome; the callback itself may fail and is only logged.
pub type EmitCallback = Box<dyn FnOnce() -> Result<()> + Send>;

struct Detached {
    event: BusEvent,
    callback: Option<EmitCallback>,
}

/// In-process typed pub/sub. Subscribe/unsubscribe take the writer lock;
/// emit snapshots both listener lists under the reader lock and invokes
/// them outside it, sequentially, type-specific first then global, in
/// registration order.
pub struct EventBus {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    detached_tx: mpsc::Sender<Detached>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (detached_tx, mut detached_rx) = mpsc::channel::<Detached>(DETACHED_CAPACITY);
        let bus = Arc::new(Self {
            registry: RwLock::new(Registry {
                typed: HashMap::new(),
                global: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            detached_tx,
        });

        // Dedicated dispatch worker for emit_detached. Holds a weak
        // reference so dropping the bus shuts the worker down.
        let weak = Arc::downgrade(&bus);
        tokio::spawn(async move {
            while let Some(item) = detached_rx.recv().await {
                let Some(bus) = weak.upgrade() else { break };
                bus.emit(&item.event).await;
                if let Some(callback) = item.callback {
                    if let Err(e) = callback() {
                        warn!("emit callback failed for {}: {}", item.event.event_type(), e);
                    }
                }
            }
        });

        bus
    }

    pub fn subscribe(&self, event_type: &'static str, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.typed.entry(event_type).or_default().push((id, listener));
        id
    }

    pub fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.global.push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for listeners in registry.typed.values_mut() {
            listeners.retain(|(lid, _)| *lid != id);
        }
        registry.global.retain(|(lid, _)| *lid != id);
    }

    /// Dispatch to all matching listeners. Never fails: per-listener errors
    /// are logged and dispatch continues. A slow listener delays the
    /// emitter; callers that must not block use [`EventBus::emit_detached`].
    pub async fn emit(&self, event: &BusEvent) {
        let snapshot: Vec<Registered> = {
            let registry = self
                .registry
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry
                .typed
                .get(event.event_type())
                .map(|v| v.as_slice())
                .unwrap_or(&[])
                .iter()
                .chain(registry.global.iter())
                .cloned()
                .collect()
        };

        debug!(
            "bus: emitting {} to {} listener(s)",
            event.event_type(),
            snapshot.len()
        );
        for (_, listener) in snapshot {
            if let Err(e) = listener.handle(event).await {
                warn!(
                    "bus: listener '{}' failed on {}: {}",
                    listener.name(),
                    event.event_type(),
                    e
                );
            }
        }
    }

    /// Schedule dispatch on the dedicated worker and return immediately.
    /// The optional callback runs after dispatch completes.
    pub fn emit_detached(&self, event: BusEvent, callback: Option<EmitCallback>) {
        if self
            .detached_tx
            .try_send(Detached { event, callback })
            .is_err()
        {
            warn!("bus: detached dispatch queue full — dropping event");
        }
    }
}

/// Audit listener wired at startup: every bus event lands in the
/// structured log. The metrics/tracing observers the bus exists for hang
/// off the same subscription point.
pub struct AuditListener;

#[async_trait]
impl EventListener for AuditListener {
    async fn handle(&self, event: &BusEvent) -> Result<()> {
        tracing::info!("audit: {} {:?}", event.event_type(), event);
        Ok(())
    }

    fn name(&self) -> &str {
        "audit"
    }
}
