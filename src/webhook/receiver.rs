use crate::bus::{BusEvent, EventBus};
use crate::config::WebhookSourceConfig;
use crate::idempotency::{IdempotencyStore, MARKER_IN_FLIGHT, processed_key};
use crate::queue::EventQueue;
use crate::webhook::{AuthContext, WebhookEvent};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

type HmacSha256 = Hmac<Sha256>;

/// Max webhook payload size: 1 MB.
const WEBHOOK_MAX_BODY: usize = 1_048_576;

/// Shared state for the webhook receiver endpoints.
#[derive(Clone)]
pub struct WebhookState {
    sources: Arc<HashMap<String, WebhookSourceConfig>>,
    idempotency: Arc<dyn IdempotencyStore>,
    queue: Arc<dyn EventQueue>,
    bus: Arc<EventBus>,
    /// Reservation TTL; must cover the retry manager's full horizon.
    horizon: Duration,
}

impl WebhookState {
    pub fn new(
        sources: HashMap<String, WebhookSourceConfig>,
        idempotency: Arc<dyn IdempotencyStore>,
        queue: Arc<dyn EventQueue>,
        bus: Arc<EventBus>,
        horizon: Duration,
    ) -> Self {
        Self {
            sources: Arc::new(sources),
            idempotency,
            queue,
            bus,
            horizon,
        }
    }
}

/// Build the webhook receiver router: `POST /api/webhooks/{source}`.
/// Other methods on the route get 405 from the router itself.
pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/api/webhooks/{source}", post(receive_handler))
        .with_state(state)
}

/// Validate an HMAC-SHA256 signature over the raw body, constant-time.
/// Accepts raw hex or the `sha256=` prefixed form.
pub fn validate_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    expected.as_bytes().ct_eq(sig.as_bytes()).into()
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

async fn receive_handler(
    State(state): State<WebhookState>,
    Path(source_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(source) = state.sources.get(&source_name) else {
        debug!("webhook: unknown source '{}'", source_name);
        return StatusCode::NOT_FOUND.into_response();
    };
    if !source.enabled {
        debug!("webhook: disabled source '{}'", source_name);
        return StatusCode::NOT_FOUND.into_response();
    }

    if body.len() > WEBHOOK_MAX_BODY {
        warn!(
            "webhook {}: payload too large ({} bytes)",
            source_name,
            body.len()
        );
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    // Event-type and delivery-id headers are required; names vary per
    // source but the roles are fixed.
    let event_type = headers
        .get(&source.event_header)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let delivery_id = headers
        .get(&source.delivery_header)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let (Some(event_type), Some(delivery_id)) = (event_type, delivery_id) else {
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"error": "missing event or delivery header"}),
        );
    };

    if !source.allowed_events.contains(&event_type) {
        debug!(
            "webhook {}: event '{}' not in allowlist",
            source_name, event_type
        );
        return reply(
            StatusCode::FORBIDDEN,
            json!({"error": format!("event type '{}' not allowed", event_type)}),
        );
    }

    match &source.secret {
        Some(secret) => {
            let signature = headers
                .get(&source.signature_header)
                .and_then(|v| v.to_str().ok());
            let valid = signature
                .is_some_and(|sig| validate_signature(secret, sig, &body));
            if !valid {
                warn!("webhook {}: invalid signature on {}", source_name, delivery_id);
                return reply(
                    StatusCode::UNAUTHORIZED,
                    json!({"error": "signature mismatch"}),
                );
            }
        }
        None => {
            warn!(
                "webhook {}: no secret configured — skipping signature check",
                source_name
            );
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            debug!("webhook {}: malformed payload: {}", source_name, e);
            return reply(StatusCode::BAD_REQUEST, json!({"error": "malformed payload"}));
        }
    };

    // Error events bypass the reservation so the sender retries them
    // naturally; everything else reserves before enqueue.
    let bypass_reservation = source.error_events.contains(&event_type);
    let key = processed_key(&source_name, &delivery_id);
    if !bypass_reservation {
        let reserved = match state
            .idempotency
            .set_if_absent(&key, MARKER_IN_FLIGHT, state.horizon)
            .await
        {
            Ok(reserved) => reserved,
            Err(e) => {
                error!("webhook {}: idempotency store failed: {}", source_name, e);
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        };
        if !reserved {
            debug!(
                "webhook {}: duplicate delivery {} — already reserved",
                source_name, delivery_id
            );
            return reply(
                StatusCode::OK,
                json!({"status": "accepted", "duplicate": true}),
            );
        }
    }

    let event = WebhookEvent {
        delivery_id: delivery_id.clone(),
        source: source_name.clone(),
        event_type: event_type.clone(),
        repo_name: payload["repository"]["full_name"]
            .as_str()
            .map(ToString::to_string),
        sender_name: payload["sender"]["login"].as_str().map(ToString::to_string),
        payload,
        auth: AuthContext {
            tenant_id: source.tenant_id.clone(),
            principal: format!("webhook:{}", source_name),
            permissions: Vec::new(),
        },
        received_at: chrono::Utc::now(),
    };

    let encoded = match serde_json::to_string(&event) {
        Ok(encoded) => encoded,
        Err(e) => {
            error!("webhook {}: failed to encode event: {}", source_name, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Err(e) = state.queue.publish(encoded).await {
        error!("webhook {}: enqueue failed: {}", source_name, e);
        // Release the reservation so the sender's retry can get through.
        if !bypass_reservation {
            if let Err(e) = state.idempotency.delete(&key).await {
                error!("webhook {}: failed to release reservation: {}", source_name, e);
            }
        }
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    state.bus.emit_detached(
        BusEvent::WebhookReceived {
            source: source_name.clone(),
            delivery_id,
            event_type,
        },
        None,
    );

    reply(
        StatusCode::OK,
        json!({"status": "accepted", "duplicate": false}),
    )
}
