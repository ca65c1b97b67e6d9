use uuid::Uuid;

/// Lifecycle events carried by the bus to observers (audit log, tracing,
/// health watchers). Listener failures never affect the emitting path.
#[derive(Debug, Clone)]
pub enum BusEvent {
    AdapterInitialized {
        tool: String,
        category: String,
    },
    AdapterClosed {
        tool: String,
    },
    HealthChanged {
        component: String,
        healthy: bool,
    },
    WebhookReceived {
        source: String,
        delivery_id: String,
        event_type: String,
    },
    RetryScheduled {
        delivery_id: String,
        retry_count: u32,
    },
    RetryExhausted {
        delivery_id: String,
        last_error: String,
    },
    SessionOpened {
        session_id: Uuid,
        agent_id: String,
    },
    SessionClosed {
        session_id: Uuid,
    },
}

impl BusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BusEvent::AdapterInitialized { .. } => "adapter.initialized",
            BusEvent::AdapterClosed { .. } => "adapter.closed",
            BusEvent::HealthChanged { .. } => "health.changed",
            BusEvent::WebhookReceived { .. } => "webhook.received",
            BusEvent::RetryScheduled { .. } => "retry.scheduled",
            BusEvent::RetryExhausted { .. } => "retry.exhausted",
            BusEvent::SessionOpened { .. } => "session.opened",
            BusEvent::SessionClosed { .. } => "session.closed",
        }
    }
}
