pub mod breaker;
pub mod limiter;
pub mod registry;

pub use breaker::{BreakerSettings, CircuitBreaker, Counts};
pub use limiter::TokenBucket;
pub use registry::{BreakerRegistry, LimiterRegistry};
