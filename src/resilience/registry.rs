use crate::config::{BreakerConfig, LimiterConfig};
use crate::resilience::breaker::{BreakerSettings, CircuitBreaker};
use crate::resilience::limiter::TokenBucket;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Per-name circuit breaker singletons. Unknown names auto-create an entry
/// with the default settings; explicit registration is idempotent: a
/// second registration returns the existing instance untouched.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn default_settings(&self) -> BreakerSettings {
        BreakerSettings {
            max_requests_half_open: self.defaults.max_requests_half_open,
            interval: Duration::from_secs(self.defaults.interval_secs),
            timeout: Duration::from_secs(self.defaults.timeout_secs),
            ..BreakerSettings::with_defaults(self.defaults.min_requests, self.defaults.failure_ratio)
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self
                .breakers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }
        self.register(name, self.default_settings())
    }

    pub fn register(&self, name: &str, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = breakers.get(name) {
            debug!("breaker '{}' already registered — keeping existing instance", name);
            return existing.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(name, settings));
        breakers.insert(name.to_string(), breaker.clone());
        breaker
    }
}

/// Per-name token-bucket singletons, same contract as [`BreakerRegistry`].
pub struct LimiterRegistry {
    defaults: LimiterConfig,
    limiters: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl LimiterRegistry {
    pub fn new(defaults: LimiterConfig) -> Self {
        Self {
            defaults,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<TokenBucket> {
        {
            let limiters = self
                .limiters
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(limiter) = limiters.get(name) {
                return limiter.clone();
            }
        }
        self.register(
            name,
            self.defaults.rate,
            self.defaults.burst,
            self.defaults.wait_limit(),
        )
    }

    pub fn register(
        &self,
        name: &str,
        rate: u32,
        burst: u32,
        wait_limit: Option<Duration>,
    ) -> Arc<TokenBucket> {
        let mut limiters = self
            .limiters
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = limiters.get(name) {
            debug!("limiter '{}' already registered — keeping existing instance", name);
            return existing.clone();
        }
        let limiter = Arc::new(TokenBucket::new(name, rate, burst, wait_limit));
        limiters.insert(name.to_string(), limiter.clone());
        limiter
    }
}
