use crate::MeshError;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// Token-bucket rate limiter shared across concurrent requests. `rate`
/// tokens refill per second into a bucket of `burst` capacity.
pub struct TokenBucket {
    name: String,
    rate: u32,
    limiter: DefaultDirectRateLimiter,
    wait_limit: Option<Duration>,
}

impl TokenBucket {
    pub fn new(name: impl Into<String>, rate: u32, burst: u32, wait_limit: Option<Duration>) -> Self {
        let rate = rate.max(1);
        let burst = burst.max(1);
        let quota = Quota::per_second(NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
        Self {
            name: name.into(),
            rate,
            limiter: RateLimiter::direct(quota),
            wait_limit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking admission check; consumes a token when it returns true.
    pub fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Block until a token is available, up to the smaller of this bucket's
    /// `wait_limit` and the caller's `budget`. Returns
    /// [`MeshError::RateLimited`] with a retry hint when the bound elapses.
    pub async fn wait(&self, budget: Option<Duration>) -> Result<(), MeshError> {
        let bound = match (self.wait_limit, budget) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        match bound {
            None => {
                self.limiter.until_ready().await;
                Ok(())
            }
            Some(bound) if bound.is_zero() => {
                if self.allow() {
                    Ok(())
                } else {
                    Err(self.exceeded())
                }
            }
            Some(bound) => tokio::time::timeout(bound, self.limiter.until_ready())
                .await
                .map_err(|_| self.exceeded()),
        }
    }

    fn exceeded(&self) -> MeshError {
        // Conservative hint: one refill period, at least a second.
        let retry_after = (1000 / u64::from(self.rate)).div_ceil(1000).max(1);
        MeshError::RateLimited {
            retry_after: Some(retry_after),
        }
    }
}
