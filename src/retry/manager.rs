use crate::MeshError;
use crate::bus::{BusEvent, EventBus};
use crate::config::RetryConfig;
use crate::retry::storage::RetryStorage;
use crate::retry::types::{RetryFilter, RetryRecord, RetryStatus};
use crate::webhook::WebhookEvent;
use chrono::Utc;
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler invoked for each due retry. Production wires the worker's
/// dispatch chain here; tests inject fakes.
pub type RetryHandler =
    Arc<dyn Fn(WebhookEvent) -> BoxFuture<'static, Result<(), MeshError>> + Send + Sync>;

/// Backoff parameters: `next = now + min(max, initial * factor^(count-1))
/// ± jitter·delay`, negative jitter clamped at zero.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            backoff_factor: config.backoff_factor,
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before attempt `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(63);
        let base = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            capped + (fastrand::f64() * 2.0 - 1.0) * capped * self.jitter
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Upper bound on the whole retry schedule, rounded up to the next
    /// hour. Idempotency marker TTLs must be at least this long.
    pub fn horizon(&self) -> Duration {
        let mut total = 0.0f64;
        for attempt in 1..=self.max_retries {
            let exponent = attempt.saturating_sub(1).min(63);
            let base =
                self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
            total += base.min(self.max_backoff.as_secs_f64()) * (1.0 + self.jitter);
        }
        let hours = (total / 3600.0).ceil().max(1.0);
        Duration::from_secs(hours as u64 * 3600)
    }
}

/// Join handles for the scheduler/processor pair started by
/// [`RetryManager::start`].
pub struct RetryWorkers {
    pub scheduler: JoinHandle<()>,
    pub processor: JoinHandle<()>,
}

/// Owns persistent retry state and drives scheduled re-processing: one
/// scheduler scans storage for due Pending records into a bounded channel,
/// one processor drains the channel and invokes the configured handler.
/// Cheap to clone; the scheduler and processor tasks carry their own
/// clones.
#[derive(Clone)]
pub struct RetryManager {
    storage: Arc<dyn RetryStorage>,
    policy: RetryPolicy,
    bus: Arc<EventBus>,
    handler: Arc<StdMutex<Option<RetryHandler>>>,
    tick: Duration,
    queue_capacity: usize,
    handler_deadline: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RetryManager {
    pub fn new(storage: Arc<dyn RetryStorage>, config: &RetryConfig, bus: Arc<EventBus>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            storage,
            policy: RetryPolicy::from_config(config),
            bus,
            handler: Arc::new(StdMutex::new(None)),
            tick: Duration::from_millis(config.scheduler_tick_ms),
            queue_capacity: config.queue_capacity.max(1),
            handler_deadline: Duration::from_secs(config.handler_deadline_secs),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn set_handler(&self, handler: RetryHandler) {
        *self
            .handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handler);
    }

    /// Record a transient failure and schedule the next attempt, or mark
    /// the record Failed once the attempt budget is spent. Terminal
    /// records are left untouched.
    pub async fn schedule(&self, event: &WebhookEvent, error: &str) -> anyhow::Result<RetryRecord> {
        let existing = self.storage.get(&event.delivery_id).await?;
        let is_new = existing.is_none();
        let mut record = match existing {
            Some(record) if record.status.is_terminal() => {
                debug!(
                    "retry {}: already {} — ignoring schedule",
                    record.delivery_id, record.status
                );
                return Ok(record);
            }
            Some(record) => record,
            None => RetryRecord::new(event.clone()),
        };

        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();

        if record.retry_count >= self.policy.max_retries {
            record.status = RetryStatus::Failed;
            record.next_retry = None;
            warn!(
                "retry {}: budget exhausted after {} attempt(s)",
                record.delivery_id, record.retry_count
            );
            self.bus.emit_detached(
                BusEvent::RetryExhausted {
                    delivery_id: record.delivery_id.clone(),
                    last_error: error.to_string(),
                },
                None,
            );
        } else {
            record.retry_count += 1;
            record.status = RetryStatus::Pending;
            let delay = self.policy.delay_for(record.retry_count);
            record.next_retry = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
            );
            debug!(
                "retry {}: attempt {} scheduled in {}ms",
                record.delivery_id,
                record.retry_count,
                delay.as_millis()
            );
            self.bus.emit_detached(
                BusEvent::RetryScheduled {
                    delivery_id: record.delivery_id.clone(),
                    retry_count: record.retry_count,
                },
                None,
            );
        }

        if is_new {
            self.storage.store(&record).await?;
        } else {
            self.storage.update(&record).await?;
        }
        Ok(record)
    }

    /// Mark a delivery permanently failed (non-retryable error).
    pub async fn record_permanent_failure(
        &self,
        event: &WebhookEvent,
        error: &str,
    ) -> anyhow::Result<RetryRecord> {
        let existing = self.storage.get(&event.delivery_id).await?;
        let is_new = existing.is_none();
        let mut record = match existing {
            Some(record) if record.status.is_terminal() => return Ok(record),
            Some(record) => record,
            None => RetryRecord::new(event.clone()),
        };
        record.status = RetryStatus::Failed;
        record.next_retry = None;
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();

        if is_new {
            self.storage.store(&record).await?;
        } else {
            self.storage.update(&record).await?;
        }
        self.bus.emit_detached(
            BusEvent::RetryExhausted {
                delivery_id: record.delivery_id.clone(),
                last_error: error.to_string(),
            },
            None,
        );
        Ok(record)
    }

    /// Transition any non-terminal record to Cancelled. In-flight work is
    /// not interrupted; its result is ignored when it lands.
    pub async fn cancel(&self, delivery_id: &str) -> anyhow::Result<bool> {
        let Some(mut record) = self.storage.get(delivery_id).await? else {
            return Ok(false);
        };
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = RetryStatus::Cancelled;
        record.next_retry = None;
        record.updated_at = Utc::now();
        self.storage.update(&record).await?;
        info!("retry {}: cancelled", delivery_id);
        Ok(true)
    }

    /// Start the scheduler/processor pair. Call [`RetryManager::stop`] to
    /// wind both down.
    pub fn start(&self) -> RetryWorkers {
        let (due_tx, mut due_rx) = mpsc::channel::<String>(self.queue_capacity);

        let scheduler = {
            let manager = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(manager.tick) => {}
                    }
                    let due = match manager
                        .storage
                        .list(&RetryFilter::due_pending(Utc::now()))
                        .await
                    {
                        Ok(due) => due,
                        Err(e) => {
                            error!("retry scheduler: storage scan failed: {}", e);
                            continue;
                        }
                    };
                    for record in due {
                        match due_tx.try_send(record.delivery_id) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(id)) => {
                                // Deferred: the record stays Pending and is
                                // picked up on a later tick.
                                warn!("retry scheduler: channel full — deferring {}", id);
                                break;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
            })
        };

        let processor = {
            let manager = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        next = due_rx.recv() => match next {
                            Some(delivery_id) => manager.process_one(&delivery_id).await,
                            None => break,
                        },
                    }
                }
            })
        };

        RetryWorkers {
            scheduler,
            processor,
        }
    }

    pub fn stop(&self) {
        self.shutdown_tx.send(true).ok();
    }

    /// Pick one due record: Pending -> InProgress, invoke the handler
    /// under its deadline, then record the outcome (unless the record was
    /// cancelled while in flight).
    async fn process_one(&self, delivery_id: &str) {
        let record = match self.storage.get(delivery_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                error!("retry {}: storage read failed: {}", delivery_id, e);
                return;
            }
        };
        if record.status != RetryStatus::Pending {
            debug!(
                "retry {}: status {} at pick time — skipping",
                delivery_id, record.status
            );
            return;
        }

        let mut picked = record;
        picked.status = RetryStatus::InProgress;
        picked.updated_at = Utc::now();
        if let Err(e) = self.storage.update(&picked).await {
            error!("retry {}: failed to mark in-progress: {}", delivery_id, e);
            return;
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            warn!("retry {}: no handler configured — leaving pending", delivery_id);
            picked.status = RetryStatus::Pending;
            self.storage.update(&picked).await.ok();
            return;
        };

        let outcome = match tokio::time::timeout(
            self.handler_deadline,
            handler(picked.event.clone()),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(MeshError::Transient(format!(
                "retry handler exceeded {}s deadline",
                self.handler_deadline.as_secs()
            ))),
        };

        // Cancel may have landed while the handler ran; its result is
        // then ignored.
        match self.storage.get(delivery_id).await {
            Ok(Some(current)) if current.status == RetryStatus::Cancelled => {
                info!("retry {}: cancelled mid-flight — result ignored", delivery_id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("retry {}: storage read failed: {}", delivery_id, e);
                return;
            }
        }

        match outcome {
            Ok(()) => {
                picked.status = RetryStatus::Success;
                picked.next_retry = None;
                picked.updated_at = Utc::now();
                if let Err(e) = self.storage.update(&picked).await {
                    error!("retry {}: failed to record success: {}", delivery_id, e);
                } else {
                    info!(
                        "retry {}: succeeded on attempt {}",
                        delivery_id, picked.retry_count
                    );
                }
            }
            Err(e) if e.is_retryable() => {
                if let Err(e) = self.schedule(&picked.event, &e.to_string()).await {
                    error!("retry {}: failed to reschedule: {}", delivery_id, e);
                }
            }
            Err(e) => {
                if let Err(e) = self.record_permanent_failure(&picked.event, &e.to_string()).await
                {
                    error!("retry {}: failed to record failure: {}", delivery_id, e);
                }
            }
        }
    }
}
