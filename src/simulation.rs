//! In-process wiring of the engine with simulated stage workers.
//!
//! [`InMemoryEngine`] assembles the dispatcher over the in-memory stores and
//! the channel gateway. [`SimulatedWorkers`] drains that channel and answers
//! every request with a completion event, optionally failing selected topics.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audit::{AuditSink, InMemoryAuditSink, WebhookNotifier};
use crate::config::EngineConfig;
use crate::context::InMemoryJobContextStore;
use crate::dispatcher::{DispatcherSettings, StageDispatcher};
use crate::error::EngineError;
use crate::gateway::{ChannelGateway, CompletionEvent, StageEnvelope, StageGateway};
use crate::guard::TriggerGuard;
use crate::retry::TokioRetryScheduler;
use crate::state_machine::{BatchStatus, TransactionStatus};
use crate::store::{EntityStore, InMemoryEntityStore};
use crate::topic::StageTopic;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct InMemoryEngine {
    pub dispatcher: StageDispatcher,
    pub store: Arc<InMemoryEntityStore>,
    pub contexts: Arc<InMemoryJobContextStore>,
    pub audit: Arc<InMemoryAuditSink>,
    pub retries: Arc<TokioRetryScheduler>,
    requests: Option<UnboundedReceiver<StageEnvelope>>,
    retry_failures: JoinHandle<()>,
}

impl InMemoryEngine {
    /// Wire the engine. Must be called inside a tokio runtime: the task that
    /// settles failed retries is spawned here.
    pub fn new(
        settings: DispatcherSettings,
        context_ttl: Option<Duration>,
        webhook: Option<&str>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(InMemoryEntityStore::new());
        let contexts = Arc::new(match context_ttl {
            Some(ttl) => InMemoryJobContextStore::with_ttl(ttl),
            None => InMemoryJobContextStore::new(),
        });
        let audit = Arc::new(InMemoryAuditSink::new());
        let sink: Arc<dyn AuditSink> = match webhook {
            Some(url) => Arc::new(WebhookNotifier::new(audit.clone(), url)?),
            None => audit.clone(),
        };

        let (gateway, requests) = ChannelGateway::new();
        let gateway: Arc<dyn StageGateway> = Arc::new(gateway);
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let retries = Arc::new(
            TokioRetryScheduler::new(Arc::clone(&gateway), TriggerGuard::new(store.clone()))
                .report_failures(failures_tx),
        );
        let dispatcher = StageDispatcher::new(
            store.clone(),
            contexts.clone(),
            gateway,
            sink,
            retries.clone(),
            settings,
        );
        let retry_failures = dispatcher.watch_retry_failures(failures);

        Ok(Self {
            dispatcher,
            store,
            contexts,
            audit,
            retries,
            requests: Some(requests),
            retry_failures,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::new(
            config.dispatcher_settings(),
            Some(config.context_ttl()),
            config.notification_webhook.as_deref(),
        )
    }

    /// Hand out the stage request stream. Only the first call gets it.
    pub fn take_requests(&mut self) -> Option<UnboundedReceiver<StageEnvelope>> {
        self.requests.take()
    }

    /// Poll until the transaction is terminal or `timeout` elapses. Returns the
    /// last status seen.
    pub async fn wait_for_transaction(
        &self,
        transaction_id: &str,
        timeout: Duration,
    ) -> Result<Option<TransactionStatus>, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.store.transaction(transaction_id).await?.map(|t| t.status);
            if status.is_some_and(TransactionStatus::is_terminal) || Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until no job context is left and no retry timer is pending.
    /// Returns `false` on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !(self.contexts.is_empty() && self.retries.in_flight() == 0) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        true
    }

    pub async fn wait_for_batch(&self, batch_id: &str, timeout: Duration) -> Result<Option<BatchStatus>, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.store.batch(batch_id).await?.map(|b| b.status);
            if status.is_some_and(BatchStatus::is_terminal) || Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for InMemoryEngine {
    fn drop(&mut self) {
        self.retry_failures.abort();
    }
}

/// Which requests the simulated workers should fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailurePlan {
    /// Answer `topic` with 503 while the request's attempt is below the count.
    pub transient: Option<(StageTopic, u32)>,
    /// Answer `topic` with 400 for the first owner that reaches it.
    pub terminal: Option<StageTopic>,
}

pub struct SimulatedWorkers {
    batches: usize,
    plan: FailurePlan,
    latency: Duration,
    terminal_owner: Mutex<Option<String>>,
}

impl SimulatedWorkers {
    /// Workers whose split stages produce `batches` child batches.
    pub fn new(batches: usize, plan: FailurePlan) -> Self {
        Self {
            batches,
            plan,
            latency: Duration::ZERO,
            terminal_owner: Mutex::new(None),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The completion a worker sends back for `envelope`.
    pub fn respond(&self, envelope: &StageEnvelope) -> CompletionEvent {
        let job_id = envelope.request.job_id.as_str();
        let body = &envelope.request.body;
        let attempt = body["attempt"].as_u64().unwrap_or(0);
        let owner = owner_id(body);

        if let Some((topic, failing_attempts)) = self.plan.transient
            && topic == envelope.topic
            && attempt < u64::from(failing_attempts)
        {
            return CompletionEvent::new(job_id, 503, json!({"error": "worker unavailable"}));
        }
        if let Some(topic) = self.plan.terminal
            && topic == envelope.topic
        {
            let mut first = self.terminal_owner.lock();
            if first.get_or_insert_with(|| owner.clone()) == &owner {
                return CompletionEvent::new(job_id, 400, json!({"error": "rejected by worker"}));
            }
        }

        let result = match envelope.topic {
            StageTopic::EmailBatchQueued | StageTopic::TrainBatchQueued => {
                let batches: Vec<Value> = (1..=self.batches)
                    .map(|n| json!({ "batch_id": format!("{owner}-B{n}") }))
                    .collect();
                json!({ "batches": batches })
            }
            StageTopic::ApiCallQueued => json!({ "delivered": true }),
            topic => json!({ "stage": topic, "documents": 1 }),
        };
        CompletionEvent::new(job_id, 200, result)
    }

    /// Answer every request arriving on `requests`, each on its own task after
    /// the configured latency.
    pub fn spawn(self: Arc<Self>, dispatcher: StageDispatcher, mut requests: UnboundedReceiver<StageEnvelope>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = requests.recv().await {
                let workers = Arc::clone(&self);
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if !workers.latency.is_zero() {
                        tokio::time::sleep(workers.latency).await;
                    }
                    let event = workers.respond(&envelope);
                    let job_id = event.job_id.clone();
                    match dispatcher.handle_completion(event).await {
                        Ok(outcome) => tracing::debug!(job_id = %job_id, outcome = ?outcome, "completion handled"),
                        Err(err) => tracing::error!(job_id = %job_id, error = %err, "completion failed"),
                    }
                });
            }
        })
    }
}

fn owner_id(body: &Value) -> String {
    body["batch_id"]
        .as_str()
        .or_else(|| body["transaction_id"].as_str())
        .unwrap_or("unknown")
        .to_string()
}
