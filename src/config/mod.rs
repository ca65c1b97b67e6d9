pub mod loader;
pub mod schema;

pub use loader::load_config;
pub use schema::{
    BreakerConfig, Config, DispatchConfig, GatewayConfig, LimiterConfig, RetryConfig,
    SessionConfig, ToolsConfig, WebhookSourceConfig, WorkerConfig,
};
