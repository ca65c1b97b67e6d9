use crate::MeshError;
use crate::bus::{BusEvent, EventBus};
use crate::config::DispatchConfig;
use crate::resilience::{BreakerRegistry, LimiterRegistry};
use crate::tools::base::{Invocation, ToolAdapter, ToolDescriptor, ToolFilter};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

struct Entry {
    descriptor: ToolDescriptor,
    validator: jsonschema::Validator,
    adapter: Arc<dyn ToolAdapter>,
}

/// Maps `(tool, action)` to an adapter and wraps every invocation in the
/// resilience pipeline: schema validation, per-category rate limit and
/// circuit breaker, bounded in-call retry with capped exponential backoff.
///
/// Built once at startup, then frozen behind an `Arc`; lookups after that
/// point are lock-free.
pub struct ToolRegistry {
    tools: HashMap<Uuid, Entry>,
    by_name: HashMap<String, Uuid>,
    limiters: Arc<LimiterRegistry>,
    breakers: Arc<BreakerRegistry>,
    bus: Arc<EventBus>,
    config: DispatchConfig,
}

impl ToolRegistry {
    pub fn new(
        limiters: Arc<LimiterRegistry>,
        breakers: Arc<BreakerRegistry>,
        bus: Arc<EventBus>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            tools: HashMap::new(),
            by_name: HashMap::new(),
            limiters,
            breakers,
            bus,
            config,
        }
    }

    /// Register an adapter. Startup-only: the registry is immutable once
    /// shared. Duplicate names refuse registration.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) -> anyhow::Result<()> {
        let descriptor = adapter.descriptor();
        if self.by_name.contains_key(&descriptor.name) {
            anyhow::bail!("tool '{}' already registered", descriptor.name);
        }
        let validator = jsonschema::validator_for(&descriptor.input_schema).map_err(|e| {
            anyhow::anyhow!("tool '{}': invalid input schema: {}", descriptor.name, e)
        })?;

        self.bus.emit_detached(
            BusEvent::AdapterInitialized {
                tool: descriptor.name.clone(),
                category: descriptor.category.clone(),
            },
            None,
        );
        self.by_name
            .insert(descriptor.name.clone(), descriptor.tool_id);
        self.tools.insert(
            descriptor.tool_id,
            Entry {
                descriptor,
                validator,
                adapter,
            },
        );
        Ok(())
    }

    /// Descriptors matching the filter, sorted by name.
    pub fn list(&self, filter: &ToolFilter) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .values()
            .filter(|entry| filter.matches(&entry.descriptor))
            .map(|entry| entry.descriptor.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn describe(&self, selector: &str) -> Result<ToolDescriptor, MeshError> {
        self.resolve(selector)
            .map(|entry| entry.descriptor.clone())
    }

    /// Resolve by tool id (uuid) or by name.
    fn resolve(&self, selector: &str) -> Result<&Entry, MeshError> {
        let id = selector
            .parse::<Uuid>()
            .ok()
            .or_else(|| self.by_name.get(selector).copied())
            .ok_or_else(|| MeshError::ToolNotFound(selector.to_string()))?;
        self.tools
            .get(&id)
            .filter(|entry| entry.descriptor.enabled)
            .ok_or_else(|| MeshError::ToolNotFound(selector.to_string()))
    }

    /// Execute pipeline, in order: resolve, validate, rate-limit, breaker,
    /// invoke with a derived deadline, classify. The rate-limit wait is
    /// charged before breaker admission. Retry here is bounded and
    /// independent of the webhook retry manager.
    pub async fn execute(
        &self,
        selector: &str,
        action: &str,
        arguments: &Value,
        passthrough: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, MeshError> {
        let entry = self.resolve(selector)?;
        self.validate(entry, arguments)?;

        let deadline = deadline.unwrap_or_else(|| self.config.request_timeout());
        let guard_name = format!("tool:{}", entry.descriptor.category);

        let limiter = self.limiters.get_or_create(&guard_name);
        limiter.wait(Some(deadline)).await?;

        let breaker = self.breakers.get_or_create(&guard_name);
        let tool_name = entry.descriptor.name.as_str();

        // Unknown errors get exactly one transient classification, then
        // escalate.
        let mut unknown_budget = 1u32;
        let mut attempt = 0u32;
        loop {
            let result = breaker
                .call(async {
                    let call = Invocation {
                        action,
                        arguments,
                        passthrough,
                        deadline,
                    };
                    match tokio::time::timeout(deadline, entry.adapter.invoke(call)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(MeshError::Transient(format!(
                            "tool '{}' timed out after {}ms",
                            tool_name,
                            deadline.as_millis()
                        ))),
                    }
                })
                .await;

            let err = match result {
                Ok(bytes) => return Ok(bytes),
                Err(err) => err,
            };

            let retryable = if err.is_retryable() {
                true
            } else if matches!(err, MeshError::Internal(_)) && unknown_budget > 0 {
                unknown_budget -= 1;
                true
            } else {
                false
            };

            if !retryable || attempt >= self.config.retry_max {
                if attempt > 0 {
                    warn!(
                        "tool '{}' failed after {} attempt(s): {}",
                        tool_name,
                        attempt + 1,
                        err
                    );
                }
                return Err(err);
            }

            let delay = self.backoff(attempt);
            debug!(
                "tool '{}' transient failure (attempt {}): {} — retrying in {}ms",
                tool_name,
                attempt + 1,
                err,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn validate(&self, entry: &Entry, arguments: &Value) -> Result<(), MeshError> {
        let problems: Vec<String> = entry
            .validator
            .iter_errors(arguments)
            .map(|e| {
                let path = e.instance_path().to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(MeshError::InvalidArguments(problems.join("; ")))
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_backoff();
        let capped = initial.saturating_mul(2u32.saturating_pow(attempt));
        capped.min(self.config.max_backoff())
    }
}
