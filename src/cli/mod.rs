use crate::bus::{AuditListener, EventBus};
use crate::config::{Config, load_config};
use crate::config::loader::lint_config;
use crate::context::{ContextManager, InMemoryContextStorage};
use crate::gateway;
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore, MARKER_COMPLETED, processed_key};
use crate::queue::InMemoryQueue;
use crate::resilience::{BreakerRegistry, LimiterRegistry};
use crate::retry::RetryManager;
use crate::session::{SessionDirectory, SessionManager};
use crate::tools::ToolRegistry;
use crate::tools::agent::AgentAdapter;
use crate::tools::github::GithubAdapter;
use crate::tools::webhook::WebhookDispatchAdapter;
use crate::webhook::WebhookState;
use crate::worker::{WorkerPool, dispatch_processor};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "devmesh", version = crate::VERSION, about = "Tool-execution gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway.
    Serve {
        /// Path to a JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the listen host.
        #[arg(long)]
        host: Option<String>,
        /// Override the listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate a config file and print warnings.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            serve(config).await
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            let warnings = lint_config(&config);
            if warnings.is_empty() {
                println!("config ok");
            } else {
                for warning in &warnings {
                    println!("warning: {}", warning);
                }
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let bus = EventBus::new();
    bus.subscribe_all(Arc::new(AuditListener));

    let limiters = Arc::new(LimiterRegistry::new(config.limiter.clone()));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let directory = SessionDirectory::new();

    let mut registry = ToolRegistry::new(
        limiters,
        breakers,
        bus.clone(),
        config.dispatch.clone(),
    );
    registry.register(Arc::new(GithubAdapter::new(
        config.tools.github_base_url.clone(),
    )))?;
    registry.register(Arc::new(AgentAdapter::new(Arc::new(directory.clone()))))?;
    registry.register(Arc::new(WebhookDispatchAdapter::new()))?;
    let registry = Arc::new(registry);

    let contexts = Arc::new(ContextManager::new(Arc::new(InMemoryContextStorage::new())));
    let sessions = SessionManager::new(
        directory,
        registry.clone(),
        contexts,
        bus.clone(),
        config.session.clone(),
    );

    // Webhook pipeline. The queue, idempotency store, and retry storage
    // are in-process here; production swaps durable implementations in
    // through the same ports.
    let queue = Arc::new(InMemoryQueue::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let retry_storage = Arc::new(crate::retry::InMemoryRetryStorage::new());
    let retry = Arc::new(RetryManager::new(
        retry_storage,
        &config.retry,
        bus.clone(),
    ));
    let horizon = retry.policy().horizon();

    let process = dispatch_processor(registry.clone());
    {
        // Retry handler: same dispatch chain, plus the completion marker
        // so a late duplicate is still skipped after a successful retry.
        let process = process.clone();
        let idempotency = idempotency.clone();
        retry.set_handler(Arc::new(move |event| {
            let process = process.clone();
            let idempotency = idempotency.clone();
            Box::pin(async move {
                process(event.clone()).await?;
                let key = processed_key(&event.source, &event.delivery_id);
                if let Err(e) = idempotency.set(&key, MARKER_COMPLETED, horizon).await {
                    warn!("retry handler: marker write failed: {}", e);
                }
                Ok(())
            })
        }));
    }
    let retry_workers = retry.start();

    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        idempotency.clone(),
        retry.clone(),
        process,
        config.worker.concurrency,
        horizon,
    ));
    let worker_handles = pool.start();

    let webhooks = WebhookState::new(
        config.webhooks.clone(),
        idempotency,
        queue.clone(),
        bus,
        horizon,
    );
    let router = gateway::build_router(sessions, webhooks);
    let (server, addr) = gateway::start(&config.gateway.host, config.gateway.port, router).await?;
    info!("devmesh {} ready on {}", crate::VERSION, addr);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Stop intake first, then drain the moving parts.
    server.abort();
    queue.close();
    pool.stop();
    retry.stop();
    for handle in worker_handles {
        handle.await.ok();
    }
    retry_workers.scheduler.await.ok();
    retry_workers.processor.await.ok();
    Ok(())
}
