//! Durable job-state store.
//!
//! Per-job state (request fields, cancellation flag, progress, final result)
//! lives in a key-value store with a TTL so a client can reconnect to a
//! running or recently finished job. Keys follow `job:<type>:<id>`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-process store with lazy expiry.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, (Value, Instant)>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.1 > Instant::now() {
                return Ok(Some(entry.0.clone()));
            }
        }
        // Expired entries are dropped on first read past their deadline.
        self.entries
            .remove_if(key, |_, (_, deadline)| *deadline <= Instant::now());
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Typed facade over the raw store used by the job managers.
pub struct StateManager {
    store: std::sync::Arc<dyn StateStore>,
    ttl: Duration,
}

impl StateManager {
    pub fn new(store: std::sync::Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(job_type: &str, job_id: &str) -> String {
        format!("job:{job_type}:{job_id}")
    }

    pub async fn set_job_state<T: serde::Serialize>(
        &self,
        job_type: &str,
        job_id: &str,
        state: &T,
    ) -> Result<()> {
        let value = serde_json::to_value(state)
            .map_err(|e| EngineError::Internal(format!("job state serialization failed: {e}")))?;
        self.store.set(&Self::key(job_type, job_id), value, self.ttl).await
    }

    pub async fn get_job_state<T: serde::de::DeserializeOwned>(
        &self,
        job_type: &str,
        job_id: &str,
    ) -> Result<Option<T>> {
        let value = self.store.get(&Self::key(job_type, job_id)).await?;
        match value {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| EngineError::Internal(format!("job state deserialization failed: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn delete_job_state(&self, job_type: &str, job_id: &str) -> Result<()> {
        self.store.delete(&Self::key(job_type, job_id)).await
    }
}
