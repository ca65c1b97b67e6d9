use crate::tools::ToolRegistry;
use crate::{MeshError, MeshResult};
use crate::session::rpc::RpcError;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// One batch entry. `name` selects the tool (name or uuid); `action` is
/// optional for adapters that expose a single operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub id: String,
    #[serde(alias = "toolId")]
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(alias = "items")]
    pub tools: Vec<BatchItem>,
    #[serde(default)]
    pub parallel: bool,
}

/// Per-item outcome, aligned with the input by `id` and `index`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub duration_ms: u64,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub results: Vec<ToolOutcome>,
    pub success_count: usize,
    pub error_count: usize,
    /// Wall clock of the whole batch, not the sum of items.
    pub duration_ms: u64,
    pub parallel: bool,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Executes batches against the dispatch pipeline. Parallel batches run
/// under a concurrency cap with per-item deadlines derived from the batch
/// deadline; sequential batches run in order and continue past per-item
/// failures. Per-item failures never fail the batch at the RPC level.
#[derive(Clone)]
pub struct BatchExecutor {
    max_parallel: usize,
    batch_deadline: Duration,
}

impl BatchExecutor {
    pub fn new(max_parallel: usize, batch_deadline: Duration) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            batch_deadline,
        }
    }

    pub async fn execute(
        &self,
        registry: &Arc<ToolRegistry>,
        passthrough: &HashMap<String, String>,
        request: BatchRequest,
    ) -> MeshResult<BatchResult> {
        // Item ids must be unique within the batch: an envelope error,
        // not a per-item one.
        let mut seen = HashSet::new();
        for item in &request.tools {
            if !seen.insert(item.id.as_str()) {
                return Err(MeshError::InvalidArguments(format!(
                    "duplicate batch item id '{}'",
                    item.id
                )));
            }
        }

        let started = Instant::now();
        let parallel = request.parallel;

        let results = if request.tools.is_empty() {
            Vec::new()
        } else if parallel {
            self.run_parallel(registry, passthrough, request.tools).await
        } else {
            self.run_sequential(registry, passthrough, request.tools).await
        };

        let success_count = results.iter().filter(|r| r.status == "success").count();
        let error_count = results.len() - success_count;
        Ok(BatchResult {
            results,
            success_count,
            error_count,
            duration_ms: started.elapsed().as_millis() as u64,
            parallel,
        })
    }

    async fn run_parallel(
        &self,
        registry: &Arc<ToolRegistry>,
        passthrough: &HashMap<String, String>,
        items: Vec<BatchItem>,
    ) -> Vec<ToolOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let deadline = self.batch_deadline;

        let tasks = items.into_iter().enumerate().map(|(index, item)| {
            let registry = registry.clone();
            let passthrough = passthrough.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_item(&registry, &passthrough, item, index, deadline).await
            })
        });

        // join_all preserves input order, which keeps results aligned with
        // items even though completion order differs.
        join_all(tasks)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| {
                joined.unwrap_or_else(|e| ToolOutcome {
                    id: format!("item-{}", index),
                    status: "error",
                    result: None,
                    error: Some(RpcError::from(&MeshError::Internal(anyhow::anyhow!(
                        "batch task failed: {}",
                        e
                    )))),
                    duration_ms: 0,
                    index,
                })
            })
            .collect()
    }

    async fn run_sequential(
        &self,
        registry: &Arc<ToolRegistry>,
        passthrough: &HashMap<String, String>,
        items: Vec<BatchItem>,
    ) -> Vec<ToolOutcome> {
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            // Continue-on-error: item N+1 runs regardless of item N.
            let outcome =
                run_item(registry, passthrough, item, index, self.batch_deadline).await;
            results.push(outcome);
        }
        results
    }
}

async fn run_item(
    registry: &Arc<ToolRegistry>,
    passthrough: &HashMap<String, String>,
    item: BatchItem,
    index: usize,
    deadline: Duration,
) -> ToolOutcome {
    let started = Instant::now();

    // Credential resolution: exact tool name first, then tool family
    // (category).
    let credential = passthrough.get(&item.name).cloned().or_else(|| {
        registry
            .describe(&item.name)
            .ok()
            .and_then(|d| passthrough.get(&d.category).cloned())
    });

    let outcome = registry
        .execute(
            &item.name,
            &item.action,
            &item.arguments,
            credential.as_deref(),
            Some(deadline),
        )
        .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(bytes) => ToolOutcome {
            id: item.id,
            status: "success",
            result: Some(bytes_to_value(&bytes)),
            error: None,
            duration_ms,
            index,
        },
        Err(err) => ToolOutcome {
            id: item.id,
            status: "error",
            result: None,
            error: Some(RpcError::from(&err)),
            duration_ms,
            index,
        },
    }
}

/// Adapter results are opaque bytes; present them as JSON when they parse,
/// as text otherwise.
pub(crate) fn bytes_to_value(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
