use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration. Every section has serde defaults so a partial (or
/// absent) config file yields a runnable gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    pub breaker: BreakerConfig,
    pub limiter: LimiterConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub tools: ToolsConfig,
    /// Webhook sources keyed by the `{source}` path segment.
    pub webhooks: HashMap<String, WebhookSourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Stable host identifier mixed into agent_id derivation. Empty means
    /// "use the machine hostname" (resolved at startup).
    pub host_id: String,
    pub ping_interval_secs: u64,
    /// Missed pongs tolerated before the session transitions to Closing.
    pub max_missed_pongs: u32,
    pub shutdown_grace_secs: u64,
    pub batch_deadline_secs: u64,
    pub max_parallel_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            ping_interval_secs: 30,
            max_missed_pongs: 2,
            shutdown_grace_secs: 10,
            batch_deadline_secs: 120,
            max_parallel_batch: 8,
        }
    }
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn batch_deadline(&self) -> Duration {
        Duration::from_secs(self.batch_deadline_secs)
    }
}

/// Dispatch pipeline knobs: the bounded in-call retry and the default
/// per-adapter deadline. Independent of the webhook retry manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    pub retry_max: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_max: 2,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            request_timeout_secs: 30,
        }
    }
}

impl DispatchConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    pub max_requests_half_open: u32,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Default trip predicate inputs: at least `min_requests` completions
    /// in the window AND failure ratio >= `failure_ratio`.
    pub min_requests: u32,
    pub failure_ratio: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests_half_open: 1,
            interval_secs: 60,
            timeout_secs: 30,
            min_requests: 5,
            failure_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiterConfig {
    /// Steady-state tokens per second.
    pub rate: u32,
    /// Bucket capacity.
    pub burst: u32,
    /// Max time a `wait` may block, in milliseconds. None means only the
    /// caller's deadline bounds the wait.
    pub wait_limit_ms: Option<u64>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10,
            burst: 20,
            wait_limit_ms: Some(2_000),
        }
    }
}

impl LimiterConfig {
    pub fn wait_limit(&self) -> Option<Duration> {
        self.wait_limit_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_secs: u64,
    /// Symmetric jitter fraction around the computed delay.
    pub jitter: f64,
    pub scheduler_tick_ms: u64,
    pub queue_capacity: usize,
    pub handler_deadline_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            backoff_factor: 2.0,
            max_backoff_secs: 3_600,
            jitter: 0.2,
            scheduler_tick_ms: 5_000,
            queue_capacity: 256,
            handler_deadline_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    /// Override for the GitHub API base URL (tests point this at a mock).
    pub github_base_url: Option<String>,
}

/// Per-source webhook endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookSourceConfig {
    pub enabled: bool,
    /// HMAC-SHA256 secret. None disables signature verification (logged
    /// at warn on every delivery).
    pub secret: Option<String>,
    /// Event types accepted by this source. Empty list rejects everything.
    pub allowed_events: Vec<String>,
    /// Event types that bypass idempotency reservation so the sender
    /// retries them naturally.
    pub error_events: Vec<String>,
    pub event_header: String,
    pub delivery_header: String,
    pub signature_header: String,
    pub tenant_id: String,
}

impl Default for WebhookSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secret: None,
            allowed_events: Vec::new(),
            error_events: Vec::new(),
            event_header: "X-Event-Type".to_string(),
            delivery_header: "X-Delivery-Id".to_string(),
            signature_header: "X-Signature-256".to_string(),
            tenant_id: "default".to_string(),
        }
    }
}

impl WebhookSourceConfig {
    /// GitHub-flavored source: the header names GitHub actually sends.
    pub fn github(secret: Option<String>, allowed_events: Vec<String>) -> Self {
        Self {
            secret,
            allowed_events,
            event_header: "X-GitHub-Event".to_string(),
            delivery_header: "X-GitHub-Delivery".to_string(),
            signature_header: "X-Hub-Signature-256".to_string(),
            ..Self::default()
        }
    }
}
