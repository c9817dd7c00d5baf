use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::state::{BatchStatus, StageOptions, TransactionStatus};
use crate::gateway::StageRequest;
use crate::topic::StageTopic;

/// The durable status a job expects its owner to be in when the completion
/// event arrives. A mismatch means the event was already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", content = "status", rename_all = "snake_case")]
pub enum Checkpoint {
    Batch(BatchStatus),
    Transaction(TransactionStatus),
}

/// Which entity a job works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOwner {
    Batch {
        batch_id: String,
        transaction_id: Option<String>,
    },
    Transaction {
        transaction_id: String,
    },
}

impl JobOwner {
    pub fn id(&self) -> &str {
        match self {
            JobOwner::Batch { batch_id, .. } => batch_id,
            JobOwner::Transaction { transaction_id } => transaction_id,
        }
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            JobOwner::Batch { transaction_id, .. } => transaction_id.as_deref(),
            JobOwner::Transaction { transaction_id } => Some(transaction_id),
        }
    }
}

/// Ephemeral working state of one in-flight stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: String,
    pub owner: JobOwner,
    pub checkpoint: Checkpoint,
    pub topic: StageTopic,
    /// Zero for the first attempt, incremented per scheduled retry.
    pub attempt: u32,
    pub options: StageOptions,
    /// Result bodies of earlier stages, keyed by topic.
    pub handles: Value,
    pub created_at: DateTime<Utc>,
}

impl JobContext {
    /// Deterministic job id, so re-forwarding the same step is idempotent.
    pub fn job_id_for(topic: StageTopic, owner_id: &str, attempt: u32) -> String {
        format!("job:{topic}:{owner_id}:{attempt}")
    }

    pub fn new(owner: JobOwner, checkpoint: Checkpoint, topic: StageTopic, options: StageOptions) -> Self {
        Self {
            job_id: Self::job_id_for(topic, owner.id(), 0),
            owner,
            checkpoint,
            topic,
            attempt: 0,
            options,
            handles: Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn for_batch(
        batch_id: &str,
        transaction_id: Option<&str>,
        status: BatchStatus,
        topic: StageTopic,
        options: StageOptions,
    ) -> Self {
        let owner = JobOwner::Batch {
            batch_id: batch_id.to_string(),
            transaction_id: transaction_id.map(str::to_string),
        };
        Self::new(owner, Checkpoint::Batch(status), topic, options)
    }

    pub fn for_transaction(
        transaction_id: &str,
        status: TransactionStatus,
        topic: StageTopic,
        options: StageOptions,
    ) -> Self {
        let owner = JobOwner::Transaction {
            transaction_id: transaction_id.to_string(),
        };
        Self::new(owner, Checkpoint::Transaction(status), topic, options)
    }

    /// Context for the following stage of the same owner. Handles carry over.
    pub fn next_stage(&self, checkpoint: Checkpoint, topic: StageTopic) -> Self {
        Self {
            job_id: Self::job_id_for(topic, self.owner.id(), 0),
            owner: self.owner.clone(),
            checkpoint,
            topic,
            attempt: 0,
            options: self.options,
            handles: self.handles.clone(),
            created_at: Utc::now(),
        }
    }

    /// Context for the next attempt of this same stage.
    pub fn retry(&self) -> Self {
        let attempt = self.attempt + 1;
        Self {
            job_id: Self::job_id_for(self.topic, self.owner.id(), attempt),
            attempt,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Keep a stage result body as a handle for later stages.
    pub fn record_result(&mut self, body: &Value) {
        if body.is_null() {
            return;
        }
        if !self.handles.is_object() {
            self.handles = Value::Object(Default::default());
        }
        if let Some(map) = self.handles.as_object_mut() {
            map.insert(self.topic.as_str().to_string(), body.clone());
        }
    }

    /// Wire request for the stage this context tracks.
    pub fn request(&self) -> StageRequest {
        let mut body = json!({
            "attempt": self.attempt,
            "options": self.options,
            "handles": self.handles,
        });
        match &self.owner {
            JobOwner::Batch {
                batch_id,
                transaction_id,
            } => {
                body["batch_id"] = json!(batch_id);
                body["transaction_id"] = json!(transaction_id);
            }
            JobOwner::Transaction { transaction_id } => {
                body["transaction_id"] = json!(transaction_id);
            }
        }
        StageRequest {
            job_id: self.job_id.clone(),
            body,
        }
    }
}

/// Bounded, fixed-interval retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before a transient failure turns terminal.
    pub max_retries: u32,
    /// Fixed delay before a retried request is re-enqueued.
    pub retry_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Whether a job that failed on `attempt` may be tried again.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
