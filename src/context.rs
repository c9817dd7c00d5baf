//! Ephemeral per-job working state, keyed by job id.
//!
//! The store is advisory: it never decides whether a side effect happened.
//! A missing entry means the job was already finished or superseded.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::ContextStoreError;
use crate::state_machine::JobContext;

#[async_trait]
pub trait JobContextStore: Send + Sync {
    /// Store or overwrite the context under its job id.
    async fn put(&self, context: &JobContext) -> Result<(), ContextStoreError>;

    /// Store the context only if no live entry holds its job id. Returns
    /// whether this call created it; of any number of racing callers exactly
    /// one sees `true`.
    async fn put_if_absent(&self, context: &JobContext) -> Result<bool, ContextStoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobContext>, ContextStoreError>;

    /// Remove a context. Deleting an absent key is not an error.
    async fn delete(&self, job_id: &str) -> Result<(), ContextStoreError>;
}

#[derive(Debug)]
struct StoredContext {
    // Serialized form, mirroring what a shared key-value service holds.
    payload: String,
    expires_at: Option<Instant>,
}

/// Concurrency-safe key-value store with optional expiry.
#[derive(Debug, Default)]
pub struct InMemoryJobContextStore {
    entries: DashMap<String, StoredContext>,
    ttl: Option<Duration>,
}

impl InMemoryJobContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Some(ttl),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, stored| stored.expires_at.is_none_or(|at| at > now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "purged expired job contexts");
        }
        removed
    }

    fn encode(&self, context: &JobContext) -> Result<StoredContext, ContextStoreError> {
        let payload =
            serde_json::to_string(context).map_err(|e| ContextStoreError::Encoding(e.to_string()))?;
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        Ok(StoredContext { payload, expires_at })
    }

    /// Job ids currently held, in no particular order.
    pub fn job_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl JobContextStore for InMemoryJobContextStore {
    async fn put(&self, context: &JobContext) -> Result<(), ContextStoreError> {
        let stored = self.encode(context)?;
        self.entries.insert(context.job_id.clone(), stored);
        Ok(())
    }

    async fn put_if_absent(&self, context: &JobContext) -> Result<bool, ContextStoreError> {
        let stored = self.encode(context)?;
        match self.entries.entry(context.job_id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().expires_at.is_some_and(|at| at <= Instant::now()) {
                    slot.insert(stored);
                    return Ok(true);
                }
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(stored);
                Ok(true)
            }
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobContext>, ContextStoreError> {
        let Some(stored) = self.entries.get(job_id) else {
            return Ok(None);
        };
        if stored.expires_at.is_some_and(|at| at <= Instant::now()) {
            return Ok(None);
        }
        serde_json::from_str(&stored.payload)
            .map(Some)
            .map_err(|e| ContextStoreError::Encoding(e.to_string()))
    }

    async fn delete(&self, job_id: &str) -> Result<(), ContextStoreError> {
        self.entries.remove(job_id);
        Ok(())
    }
}
