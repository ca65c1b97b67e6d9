use crate::MeshError;
use crate::idempotency::{IdempotencyStore, MARKER_COMPLETED, processed_key};
use crate::queue::{EventQueue, QueueDelivery};
use crate::retry::RetryManager;
use crate::tools::ToolRegistry;
use crate::webhook::WebhookEvent;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Processing seam: the pool invokes this per decoded event. Production
/// wires [`dispatch_processor`]; tests supply fakes.
pub type ProcessFn =
    Arc<dyn Fn(WebhookEvent) -> BoxFuture<'static, Result<(), MeshError>> + Send + Sync>;

/// The production processor: route the event through the same dispatch
/// pipeline as client calls, against the internal `webhook` tool with
/// action `{source}/{event_type}`.
pub fn dispatch_processor(registry: Arc<ToolRegistry>) -> ProcessFn {
    Arc::new(move |event| {
        let registry = registry.clone();
        Box::pin(async move {
            let arguments =
                serde_json::to_value(&event).map_err(|e| MeshError::Internal(e.into()))?;
            registry
                .execute("webhook", &event.action(), &arguments, None, None)
                .await
                .map(|_| ())
        })
    })
}

/// Pool of N consumers draining the webhook queue. Each message is
/// decoded, checked against the idempotency store, processed, and acked;
/// failures are handed to the retry manager rather than nacked, so the
/// queue's own redelivery never competes with scheduled retries. Cheap to
/// clone; each consumer task carries its own clone.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn EventQueue>,
    idempotency: Arc<dyn IdempotencyStore>,
    retry: Arc<RetryManager>,
    process: ProcessFn,
    concurrency: usize,
    /// Completion marker TTL; at least the retry manager's horizon.
    horizon: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        idempotency: Arc<dyn IdempotencyStore>,
        retry: Arc<RetryManager>,
        process: ProcessFn,
        concurrency: usize,
        horizon: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            idempotency,
            retry,
            process,
            concurrency: concurrency.max(1),
            horizon,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker_id| {
                let pool = self.clone();
                tokio::spawn(async move { pool.consume_loop(worker_id).await })
            })
            .collect()
    }

    pub fn stop(&self) {
        self.shutdown_tx.send(true).ok();
    }

    async fn consume_loop(&self, worker_id: usize) {
        let mut shutdown = self.shutdown_tx.subscribe();
        debug!("worker {}: started", worker_id);
        loop {
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                pulled = self.queue.pull() => match pulled {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => break,
                    Err(e) => {
                        error!("worker {}: queue pull failed: {}", worker_id, e);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                },
            };
            self.handle_delivery(delivery).await;
        }
        debug!("worker {}: stopped", worker_id);
    }

    /// Process one queue message to its terminal outcome and ack it.
    pub async fn handle_delivery(&self, delivery: Box<dyn QueueDelivery>) {
        // Poisoned messages never loop: decode failures are acked away.
        let event: WebhookEvent = match serde_json::from_str(delivery.body()) {
            Ok(event) => event,
            Err(e) => {
                warn!("worker: malformed queue message acked: {}", e);
                if let Err(e) = delivery.ack().await {
                    error!("worker: ack failed: {}", e);
                }
                return;
            }
        };

        let key = processed_key(&event.source, &event.delivery_id);
        match self.idempotency.get(&key).await {
            Ok(Some(marker)) if marker == MARKER_COMPLETED => {
                debug!(
                    "worker: delivery {} already completed — skipping",
                    event.delivery_id
                );
                if let Err(e) = delivery.ack().await {
                    error!("worker: ack failed: {}", e);
                }
                return;
            }
            // Absent or in-flight: ours to process.
            Ok(_) => {}
            Err(e) => {
                // Without the marker we cannot guarantee at-most-once;
                // leave the message for redelivery.
                error!("worker: idempotency lookup failed: {}", e);
                if let Err(e) = delivery.nack().await {
                    error!("worker: nack failed: {}", e);
                }
                return;
            }
        }

        match (self.process)(event.clone()).await {
            Ok(()) => {
                if let Err(e) = self
                    .idempotency
                    .set(&key, MARKER_COMPLETED, self.horizon)
                    .await
                {
                    error!(
                        "worker: failed to mark {} completed: {}",
                        event.delivery_id, e
                    );
                }
                info!("worker: processed {} ({})", event.delivery_id, event.action());
            }
            Err(e) if e.is_retryable() => {
                debug!(
                    "worker: transient failure on {} — handing to retry manager: {}",
                    event.delivery_id, e
                );
                if let Err(e) = self.retry.schedule(&event, &e.to_string()).await {
                    error!("worker: failed to schedule retry: {}", e);
                }
            }
            Err(e) => {
                warn!(
                    "worker: permanent failure on {}: {}",
                    event.delivery_id, e
                );
                if let Err(e) = self
                    .retry
                    .record_permanent_failure(&event, &e.to_string())
                    .await
                {
                    error!("worker: failed to record failure: {}", e);
                }
            }
        }

        // Retries are owned by the retry manager, not queue redelivery.
        if let Err(e) = delivery.ack().await {
            error!("worker: ack failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests;
