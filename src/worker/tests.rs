use super::*;
use crate::bus::EventBus;
use crate::config::RetryConfig;
use crate::idempotency::{InMemoryIdempotencyStore, MARKER_IN_FLIGHT};
use crate::queue::InMemoryQueue;
use crate::retry::{InMemoryRetryStorage, RetryStatus, RetryStorage};
use crate::webhook::AuthContext;
use std::sync::atomic::{AtomicU32, Ordering};

const HORIZON: Duration = Duration::from_secs(3600);

struct Harness {
    pool: Arc<WorkerPool>,
    queue: Arc<InMemoryQueue>,
    idempotency: Arc<InMemoryIdempotencyStore>,
    retry_storage: Arc<InMemoryRetryStorage>,
    invocations: Arc<AtomicU32>,
}

fn harness(outcome: fn() -> Result<(), MeshError>) -> Harness {
    let queue = Arc::new(InMemoryQueue::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let retry_storage = Arc::new(InMemoryRetryStorage::new());
    let retry = Arc::new(RetryManager::new(
        retry_storage.clone(),
        &RetryConfig::default(),
        EventBus::new(),
    ));

    let invocations = Arc::new(AtomicU32::new(0));
    let process: ProcessFn = {
        let invocations = invocations.clone();
        Arc::new(move |_event| {
            let invocations = invocations.clone();
            Box::pin(async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                outcome()
            })
        })
    };

    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        idempotency.clone(),
        retry,
        process,
        2,
        HORIZON,
    ));
    Harness {
        pool,
        queue,
        idempotency,
        retry_storage,
        invocations,
    }
}

fn event(delivery_id: &str) -> WebhookEvent {
    WebhookEvent {
        delivery_id: delivery_id.to_string(),
        source: "github".into(),
        event_type: "push".into(),
        repo_name: None,
        sender_name: None,
        payload: serde_json::json!({}),
        auth: AuthContext {
            tenant_id: "t".into(),
            principal: "webhook:github".into(),
            permissions: vec![],
        },
        received_at: chrono::Utc::now(),
    }
}

async fn publish(queue: &InMemoryQueue, event: &WebhookEvent) {
    queue
        .publish(serde_json::to_string(event).unwrap())
        .await
        .unwrap();
}

async fn drain_one(h: &Harness) {
    let delivery = h.queue.pull().await.unwrap().unwrap();
    h.pool.handle_delivery(delivery).await;
}

#[tokio::test]
async fn success_marks_completed_and_acks() {
    let h = harness(|| Ok(()));
    let e = event("d-ok");
    h.idempotency
        .set_if_absent(&processed_key("github", "d-ok"), MARKER_IN_FLIGHT, HORIZON)
        .await
        .unwrap();
    publish(&h.queue, &e).await;

    drain_one(&h).await;

    assert_eq!(h.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.idempotency
            .get(&processed_key("github", "d-ok"))
            .await
            .unwrap()
            .as_deref(),
        Some(MARKER_COMPLETED)
    );
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn completed_marker_skips_processing() {
    let h = harness(|| Ok(()));
    let e = event("d-dup");
    h.idempotency
        .set(&processed_key("github", "d-dup"), MARKER_COMPLETED, HORIZON)
        .await
        .unwrap();
    publish(&h.queue, &e).await;

    drain_one(&h).await;

    // Handler never ran a second time; message still acked away.
    assert_eq!(h.invocations.load(Ordering::SeqCst), 0);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn in_flight_marker_is_processed() {
    let h = harness(|| Ok(()));
    let e = event("d-inflight");
    h.idempotency
        .set(
            &processed_key("github", "d-inflight"),
            MARKER_IN_FLIGHT,
            HORIZON,
        )
        .await
        .unwrap();
    publish(&h.queue, &e).await;

    drain_one(&h).await;
    assert_eq!(h.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_message_is_acked_not_looped() {
    let h = harness(|| Ok(()));
    h.queue.publish("{not valid".into()).await.unwrap();

    drain_one(&h).await;

    assert_eq!(h.invocations.load(Ordering::SeqCst), 0);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn transient_failure_hands_to_retry_manager() {
    let h = harness(|| Err(MeshError::Transient("downstream 503".into())));
    let e = event("d-flaky");
    publish(&h.queue, &e).await;

    drain_one(&h).await;

    let record = h.retry_storage.get("d-flaky").await.unwrap().unwrap();
    assert_eq!(record.status, RetryStatus::Pending);
    assert_eq!(record.retry_count, 1);
    // Message acked: retries are owned by the retry manager.
    assert!(h.queue.is_empty());
    // Marker still in-flight (not completed).
    assert_ne!(
        h.idempotency
            .get(&processed_key("github", "d-flaky"))
            .await
            .unwrap()
            .as_deref(),
        Some(MARKER_COMPLETED)
    );
}

#[tokio::test]
async fn permanent_failure_records_failed() {
    let h = harness(|| {
        Err(MeshError::Adapter {
            status: 422,
            message: "unprocessable".into(),
        })
    });
    let e = event("d-bad");
    publish(&h.queue, &e).await;

    drain_one(&h).await;

    let record = h.retry_storage.get("d-bad").await.unwrap().unwrap();
    assert_eq!(record.status, RetryStatus::Failed);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn pool_drains_queue_concurrently() {
    let h = harness(|| Ok(()));
    for i in 0..8 {
        publish(&h.queue, &event(&format!("d-{}", i))).await;
    }

    let handles = h.pool.start();
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while h.invocations.load(Ordering::SeqCst) < 8 {
        assert!(std::time::Instant::now() < deadline, "pool did not drain");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.pool.stop();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn dispatch_processor_routes_through_registry() {
    use crate::config::{BreakerConfig, DispatchConfig, LimiterConfig};
    use crate::resilience::{BreakerRegistry, LimiterRegistry};
    use crate::tools::webhook::WebhookDispatchAdapter;

    let handled = Arc::new(AtomicU32::new(0));
    let adapter = {
        let handled = handled.clone();
        WebhookDispatchAdapter::new().route("github/push", move |args| {
            let handled = handled.clone();
            Box::pin(async move {
                assert_eq!(args["delivery_id"], "d-dispatch");
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!("done"))
            })
        })
    };

    let mut registry = ToolRegistry::new(
        Arc::new(LimiterRegistry::new(LimiterConfig::default())),
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        EventBus::new(),
        DispatchConfig::default(),
    );
    registry.register(Arc::new(adapter)).unwrap();

    let process = dispatch_processor(Arc::new(registry));
    process(event("d-dispatch")).await.unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}
