use crate::webhook::WebhookEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a retry record. Success, Failed, and Cancelled are
/// terminal: no transition ever leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl RetryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RetryStatus::Success | RetryStatus::Failed | RetryStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetryStatus::Pending => "Pending",
            RetryStatus::InProgress => "InProgress",
            RetryStatus::Success => "Success",
            RetryStatus::Failed => "Failed",
            RetryStatus::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Durable per-delivery retry state. The stored webhook event is the
/// source of truth; records never reference queue message handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub delivery_id: String,
    pub event_type: String,
    pub event: WebhookEvent,
    pub status: RetryStatus,
    pub retry_count: u32,
    pub next_retry: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryRecord {
    pub fn new(event: WebhookEvent) -> Self {
        let now = Utc::now();
        Self {
            delivery_id: event.delivery_id.clone(),
            event_type: event.event_type.clone(),
            event,
            status: RetryStatus::Pending,
            retry_count: 0,
            next_retry: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Query filter for [`super::RetryStorage::list`]. All set fields AND
/// together.
#[derive(Debug, Clone, Default)]
pub struct RetryFilter {
    pub delivery_id: Option<String>,
    pub event_type: Option<String>,
    pub statuses: Vec<RetryStatus>,
    pub min_retry_count: Option<u32>,
    pub max_retry_count: Option<u32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Matches records whose `next_retry` is set and at or before this
    /// instant (the scheduler's "due now" scan).
    pub due_before: Option<DateTime<Utc>>,
}

impl RetryFilter {
    /// The scheduler's scan: Pending records due at `now`.
    pub fn due_pending(now: DateTime<Utc>) -> Self {
        Self {
            statuses: vec![RetryStatus::Pending],
            due_before: Some(now),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &RetryRecord) -> bool {
        if let Some(delivery_id) = &self.delivery_id {
            if record.delivery_id != *delivery_id {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if record.event_type != *event_type {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(min) = self.min_retry_count {
            if record.retry_count < min {
                return false;
            }
        }
        if let Some(max) = self.max_retry_count {
            if record.retry_count > max {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at > before {
                return false;
            }
        }
        if let Some(due) = self.due_before {
            match record.next_retry {
                Some(next) if next <= due => {}
                _ => return false,
            }
        }
        true
    }
}
