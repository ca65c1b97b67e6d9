use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// One message pulled from the queue. Ack removes it; nack returns it to
/// the queue for redelivery (at-least-once).
#[async_trait]
pub trait QueueDelivery: Send {
    fn body(&self) -> &str;
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>) -> Result<()>;
}

/// At-least-once ordered queue port between the webhook receiver and the
/// workers. Production binds a real broker; tests and the default binary
/// use [`InMemoryQueue`].
#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn publish(&self, body: String) -> Result<()>;

    /// Wait for the next message. Returns None once the queue is closed
    /// and drained.
    async fn pull(&self) -> Result<Option<Box<dyn QueueDelivery>>>;
}

const DEFAULT_CAPACITY: usize = 1024;

struct Shared {
    messages: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// FIFO in-memory queue with nack-requeue. Messages survive a worker
/// restart only as far as the process lives; the port exists precisely so
/// production can swap in a durable broker.
pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                messages: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                capacity,
            }),
        }
    }

    /// Close the queue: pending messages still drain, new publishes fail.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared
            .messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryDelivery {
    body: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl QueueDelivery for InMemoryDelivery {
    fn body(&self) -> &str {
        &self.body
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        debug!("queue: message nacked — requeueing");
        {
            let mut messages = self
                .shared
                .messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            messages.push_back(self.body);
        }
        self.shared.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl EventQueue for InMemoryQueue {
    async fn publish(&self, body: String) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            anyhow::bail!("queue is closed");
        }
        {
            let mut messages = self
                .shared
                .messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if messages.len() >= self.shared.capacity {
                anyhow::bail!("queue is full ({} messages)", messages.len());
            }
            messages.push_back(body);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn pull(&self) -> Result<Option<Box<dyn QueueDelivery>>> {
        loop {
            // Register interest before checking, so a notify between the
            // check and the await is not lost.
            let notified = self.shared.notify.notified();
            {
                let mut messages = self
                    .shared
                    .messages
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(body) = messages.pop_front() {
                    return Ok(Some(Box::new(InMemoryDelivery {
                        body,
                        shared: self.shared.clone(),
                    })));
                }
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            notified.await;
        }
    }
}
