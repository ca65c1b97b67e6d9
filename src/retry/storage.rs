use crate::retry::types::{RetryFilter, RetryRecord};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Persistence port for retry records. Implementations must be safe for
/// concurrent use and atomic per key; the manager serializes state
/// transitions by writing through this port.
#[async_trait]
pub trait RetryStorage: Send + Sync {
    async fn store(&self, record: &RetryRecord) -> Result<()>;
    async fn get(&self, delivery_id: &str) -> Result<Option<RetryRecord>>;
    async fn update(&self, record: &RetryRecord) -> Result<()>;
    async fn delete(&self, delivery_id: &str) -> Result<()>;
    async fn list(&self, filter: &RetryFilter) -> Result<Vec<RetryRecord>>;
}

#[derive(Default)]
pub struct InMemoryRetryStorage {
    records: Mutex<HashMap<String, RetryRecord>>,
}

impl InMemoryRetryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryStorage for InMemoryRetryStorage {
    async fn store(&self, record: &RetryRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(record.delivery_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, delivery_id: &str) -> Result<Option<RetryRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(delivery_id)
            .cloned())
    }

    async fn update(&self, record: &RetryRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !records.contains_key(&record.delivery_id) {
            anyhow::bail!("no retry record for delivery {}", record.delivery_id);
        }
        records.insert(record.delivery_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, delivery_id: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(delivery_id);
        Ok(())
    }

    async fn list(&self, filter: &RetryFilter) -> Result<Vec<RetryRecord>> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut matching: Vec<RetryRecord> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        // Oldest-due first so the scheduler drains in arrival order.
        matching.sort_by_key(|r| (r.next_retry, r.created_at));
        Ok(matching)
    }
}
