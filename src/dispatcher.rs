//! Stage dispatcher: applies worker completion events to the durable state.
//!
//! Every event is handled on its own, with no in-process memory shared across
//! events. A handler resolves the job context, re-reads the owner's durable
//! status and only proceeds when that status still equals the context's
//! checkpoint. The status change itself is a compare-and-set, so of any number
//! of duplicate or racing deliveries exactly one applies the step.
//!
//! Ordering of side effects per step: durable write, audit entry, next context
//! stored, next request dispatched, previous context deleted.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::audit::{AuditSink, NotificationOutcome};
use crate::barrier::{BarrierDecision, FanInBarrier, JoinPoint, PartialPolicy};
use crate::context::JobContextStore;
use crate::error::{EngineError, FailureKind, StoreError};
use crate::gateway::{CompletionEvent, StageGateway};
use crate::guard::TriggerGuard;
use crate::model::{
    Batch, BatchMode, DocumentFormat, Link, OutboundResult, Transaction, TransactionKind, TriggerFlag,
    VerificationState,
};
use crate::retry::{RetryFailure, RetryFailureCause, RetryScheduler, ScheduledRetry};
use crate::state_machine::{
    BatchRoute, BatchStatus, Checkpoint, JobContext, JobOwner, RetryConfig, StageOptions, StateMachine,
    TransactionStatus, Transition,
};
use crate::store::EntityStore;
use crate::topic::StageTopic;

/// Engine-wide knobs the dispatcher needs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DispatcherSettings {
    pub retry: RetryConfig,
    pub partial_policy: PartialPolicy,
    /// Options used when an ingest request does not carry its own.
    pub default_options: StageOptions,
}

/// What handling one event (or one resume) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// No job context under the event's job id.
    Stale,
    /// The owner already moved past the job's checkpoint.
    AlreadyApplied,
    /// The owner or its transaction failed; the pending step was dropped.
    Cancelled,
    Advanced,
    /// The stage request was published again under the same job id.
    Redispatched,
    RetryScheduled { attempt: u32 },
    Failed,
}

// Completion body of the transaction split stages.
#[derive(Debug, Deserialize)]
struct SplitResult {
    #[serde(default)]
    batches: Vec<SplitBatch>,
}

#[derive(Debug, Deserialize)]
struct SplitBatch {
    batch_id: String,
    #[serde(default)]
    mode: Option<BatchMode>,
    #[serde(default)]
    format: DocumentFormat,
}

struct BatchScope {
    batch: Batch,
    route: BatchRoute,
    cancelled: bool,
}

type JoinFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>>;

#[derive(Clone)]
pub struct StageDispatcher {
    store: Arc<dyn EntityStore>,
    contexts: Arc<dyn JobContextStore>,
    gateway: Arc<dyn StageGateway>,
    audit: Arc<dyn AuditSink>,
    retries: Arc<dyn RetryScheduler>,
    guard: TriggerGuard,
    barrier: FanInBarrier,
    settings: DispatcherSettings,
}

impl StageDispatcher {
    pub fn new(
        store: Arc<dyn EntityStore>,
        contexts: Arc<dyn JobContextStore>,
        gateway: Arc<dyn StageGateway>,
        audit: Arc<dyn AuditSink>,
        retries: Arc<dyn RetryScheduler>,
        settings: DispatcherSettings,
    ) -> Self {
        let guard = TriggerGuard::new(Arc::clone(&store));
        let barrier = FanInBarrier::new(Arc::clone(&store), settings.partial_policy);
        Self {
            store,
            contexts,
            gateway,
            audit,
            retries,
            guard,
            barrier,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Create a standalone batch and dispatch its first stage. Returns the job id.
    pub async fn ingest_batch(
        &self,
        batch_id: &str,
        mode: BatchMode,
        format: DocumentFormat,
        options: Option<StageOptions>,
    ) -> Result<String, EngineError> {
        let options = options.unwrap_or(self.settings.default_options);
        self.store.insert_batch(Batch::new(batch_id, mode, format)).await?;
        self.record(batch_id, BatchStatus::Uploading, "batch received", None).await;

        let ctx = JobContext::for_batch(
            batch_id,
            None,
            BatchStatus::Uploading,
            StageTopic::PreClassificationProcessQueued,
            options,
        );
        let job_id = ctx.job_id.clone();
        self.hand_off(None, ctx).await?;
        tracing::info!(batch_id, job_id = %job_id, "standalone batch ingested");
        Ok(job_id)
    }

    /// Create a transaction and dispatch the stage that splits it into
    /// batches. Returns the job id.
    pub async fn ingest_transaction(
        &self,
        transaction_id: &str,
        kind: TransactionKind,
        options: Option<StageOptions>,
    ) -> Result<String, EngineError> {
        let options = options.unwrap_or(self.settings.default_options);
        self.store
            .insert_transaction(Transaction::new(transaction_id, kind).with_options(options))
            .await?;
        self.record(
            transaction_id,
            TransactionStatus::Received,
            format!("{kind} transaction received"),
            None,
        )
        .await;

        let ctx = JobContext::for_transaction(transaction_id, TransactionStatus::Received, kind.ingest_topic(), options);
        let job_id = ctx.job_id.clone();
        self.hand_off(None, ctx).await?;
        tracing::info!(transaction_id, job_id = %job_id, kind = %kind, "transaction ingested");
        Ok(job_id)
    }

    /// Apply one worker completion event.
    pub async fn handle_completion(&self, event: CompletionEvent) -> Result<EventOutcome, EngineError> {
        let Some(ctx) = self.contexts.get(&event.job_id).await? else {
            tracing::info!(
                job_id = %event.job_id,
                status_code = event.status_code,
                "no job context, discarding stale event"
            );
            return Ok(EventOutcome::Stale);
        };
        tracing::debug!(
            job_id = %ctx.job_id,
            topic = %ctx.topic,
            owner_id = ctx.owner.id(),
            status_code = event.status_code,
            "completion received"
        );

        match ctx.checkpoint {
            Checkpoint::Batch(expected) => self.on_batch_event(ctx, expected, event).await,
            Checkpoint::Transaction(expected) => self.on_transaction_event(ctx, expected, event).await,
        }
    }

    /// Operator release of a batch held for review.
    pub async fn release_review(&self, batch_id: &str) -> Result<bool, EngineError> {
        let scope = self.batch_scope(batch_id).await?;
        if scope.cancelled {
            return Ok(false);
        }
        let Some(transaction_id) = scope.batch.parent.clone() else {
            return Ok(false);
        };
        if !self
            .store
            .compare_and_set_batch_status(batch_id, BatchStatus::WaitingReview, BatchStatus::Assembling)
            .await?
        {
            tracing::debug!(batch_id, status = %scope.batch.status, "batch not waiting for review");
            return Ok(false);
        }
        self.record(batch_id, BatchStatus::Assembling, "review released", None).await;

        let mut still_waiting = false;
        for link in self.store.links(&transaction_id).await? {
            if let Some(sibling) = self.store.batch(&link.batch_id).await?
                && sibling.status == BatchStatus::WaitingReview
            {
                still_waiting = true;
                break;
            }
        }
        let verification = if still_waiting {
            VerificationState::Pending
        } else {
            VerificationState::Verified
        };
        self.store.set_verification(&transaction_id, verification).await?;

        self.evaluate_join(&transaction_id, JoinPoint::OutputReady).await?;
        Ok(true)
    }

    /// Pick up a job context left behind by a crash.
    ///
    /// If the owner still sits at the checkpoint the request is published again
    /// under the same job id. If the owner moved exactly one step past it, the
    /// durable write happened but the hand-off did not, so the step is
    /// forwarded now.
    pub async fn resume_job(&self, job_id: &str) -> Result<EventOutcome, EngineError> {
        let Some(ctx) = self.contexts.get(job_id).await? else {
            return Ok(EventOutcome::Stale);
        };

        match ctx.checkpoint {
            Checkpoint::Batch(expected) => {
                let scope = self.batch_scope(ctx.owner.id()).await?;
                if scope.cancelled {
                    return self.cancel(&ctx).await;
                }
                let current = scope.batch.status;
                if current == expected {
                    self.gateway.dispatch(ctx.topic, ctx.request()).await?;
                    tracing::info!(job_id, topic = %ctx.topic, "stage request re-published");
                    return Ok(EventOutcome::Redispatched);
                }
                if StateMachine::successor(expected, &scope.route, &ctx.options) != Some(current) {
                    tracing::info!(job_id, status = %current, "leftover job context, discarding");
                    self.discard(&ctx.job_id).await;
                    return Ok(EventOutcome::AlreadyApplied);
                }
                tracing::info!(job_id, status = %current, "forwarding interrupted hand-off");
                self.forward_batch(ctx, current, &scope.route).await?;
                Ok(EventOutcome::Advanced)
            }
            Checkpoint::Transaction(expected) => {
                let txn = self.load_transaction(ctx.owner.id()).await?;
                if txn.status == TransactionStatus::Failed {
                    return self.cancel(&ctx).await;
                }
                if txn.status == expected {
                    self.gateway.dispatch(ctx.topic, ctx.request()).await?;
                    tracing::info!(job_id, topic = %ctx.topic, "stage request re-published");
                    return Ok(EventOutcome::Redispatched);
                }
                match txn.status {
                    TransactionStatus::Preprocessing if expected == TransactionStatus::Received => {
                        self.redispatch_uploads(&txn).await?;
                        self.discard(&ctx.job_id).await;
                    }
                    TransactionStatus::CallingApi | TransactionStatus::UploadingDocuments => {
                        let status = txn.status;
                        self.forward_transaction(ctx, &txn.id, status, true).await?;
                    }
                    _ => {
                        self.discard(&ctx.job_id).await;
                        return Ok(EventOutcome::AlreadyApplied);
                    }
                }
                Ok(EventOutcome::Advanced)
            }
        }
    }

    /// Settle a retry whose timer fired but whose request never went out.
    ///
    /// A guard held by another attempt means the action is already on its way,
    /// so only the context is dropped. Any other cause fails the owner.
    pub async fn on_retry_failed(&self, failure: RetryFailure) -> Result<EventOutcome, EngineError> {
        let Some(ctx) = self.contexts.get(&failure.job_id).await? else {
            return Ok(EventOutcome::Stale);
        };
        if failure.cause == RetryFailureCause::GuardTaken {
            self.record(
                ctx.owner.id(),
                "retry_dropped",
                format!("retry of {} dropped, action already triggered", failure.topic),
                None,
            )
            .await;
            self.discard(&ctx.job_id).await;
            return Ok(EventOutcome::AlreadyApplied);
        }

        tracing::error!(job_id = %ctx.job_id, topic = %failure.topic, cause = %failure.cause, "retry never dispatched");
        self.fail_owner(&ctx.owner, &format!("retry of {} failed: {}", failure.topic, failure.cause))
            .await?;
        self.discard(&ctx.job_id).await;
        Ok(EventOutcome::Failed)
    }

    /// Feed failures reported by the retry scheduler into
    /// [`on_retry_failed`](Self::on_retry_failed) until the channel closes.
    pub fn watch_retry_failures(&self, mut failures: UnboundedReceiver<RetryFailure>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                let job_id = failure.job_id.clone();
                match dispatcher.on_retry_failed(failure).await {
                    Ok(outcome) => tracing::debug!(job_id = %job_id, outcome = ?outcome, "retry failure settled"),
                    Err(err) => tracing::error!(job_id = %job_id, error = %err, "could not settle retry failure"),
                }
            }
        })
    }

    async fn on_batch_event(
        &self,
        ctx: JobContext,
        expected: BatchStatus,
        event: CompletionEvent,
    ) -> Result<EventOutcome, EngineError> {
        let scope = self.batch_scope(ctx.owner.id()).await?;
        if scope.cancelled {
            return self.cancel(&ctx).await;
        }
        if scope.batch.status != expected {
            tracing::debug!(
                job_id = %ctx.job_id,
                batch_id = %scope.batch.id,
                current = %scope.batch.status,
                expected = %expected,
                "event already applied"
            );
            return Ok(EventOutcome::AlreadyApplied);
        }

        let Some(kind) = FailureKind::from_status_code(event.status_code) else {
            return self.advance_batch(ctx, &scope, event.body).await;
        };
        if kind.is_retryable() && self.settings.retry.allows_retry(ctx.attempt) {
            return self.schedule_retry(&ctx, None, &event).await;
        }

        let reason = failure_reason(&ctx, &event, kind);
        self.fail_batch(&scope.batch.id, ctx.owner.transaction_id(), &reason, non_null(event.body))
            .await?;
        self.discard(&ctx.job_id).await;
        Ok(EventOutcome::Failed)
    }

    async fn advance_batch(
        &self,
        mut ctx: JobContext,
        scope: &BatchScope,
        body: Value,
    ) -> Result<EventOutcome, EngineError> {
        let batch_id = scope.batch.id.as_str();
        let current = scope.batch.status;
        let Some(next) = StateMachine::successor(current, &scope.route, &ctx.options) else {
            tracing::warn!(job_id = %ctx.job_id, batch_id, status = %current, "no successor for completed stage");
            self.discard(&ctx.job_id).await;
            return Ok(EventOutcome::AlreadyApplied);
        };

        if !self.store.compare_and_set_batch_status(batch_id, current, next).await? {
            tracing::debug!(job_id = %ctx.job_id, batch_id, "transition taken by a concurrent delivery");
            return Ok(EventOutcome::AlreadyApplied);
        }
        if current == BatchStatus::Classifying && scope.batch.parent.is_some() {
            self.store.mark_classified(batch_id).await?;
        }

        ctx.record_result(&body);
        self.record(batch_id, next, format!("{} completed", ctx.topic), non_null(body))
            .await;
        tracing::info!(job_id = %ctx.job_id, batch_id, from = %current, to = %next, "batch advanced");

        self.forward_batch(ctx, next, &scope.route).await?;
        Ok(EventOutcome::Advanced)
    }

    // Act on the status a batch just entered. The context is deleted last.
    async fn forward_batch(&self, ctx: JobContext, status: BatchStatus, route: &BatchRoute) -> Result<(), EngineError> {
        match StateMachine::transition_for(status, route, &ctx.options) {
            Some(Transition::Dispatch { status, topic }) => {
                let next = ctx.next_stage(Checkpoint::Batch(status), topic);
                self.hand_off(Some(&ctx), next).await
            }
            Some(Transition::Join { join, .. }) => {
                if let Some(transaction_id) = ctx.owner.transaction_id() {
                    self.evaluate_join(transaction_id, join).await?;
                }
                self.discard(&ctx.job_id).await;
                Ok(())
            }
            Some(Transition::Hold { .. }) => {
                if let Some(transaction_id) = ctx.owner.transaction_id() {
                    self.store
                        .set_verification(transaction_id, VerificationState::Pending)
                        .await?;
                }
                tracing::info!(batch_id = ctx.owner.id(), "batch waiting for review");
                self.discard(&ctx.job_id).await;
                Ok(())
            }
            Some(Transition::Complete) => {
                tracing::info!(batch_id = ctx.owner.id(), "batch completed");
                self.discard(&ctx.job_id).await;
                Ok(())
            }
            None => {
                self.discard(&ctx.job_id).await;
                Ok(())
            }
        }
    }

    async fn on_transaction_event(
        &self,
        ctx: JobContext,
        expected: TransactionStatus,
        event: CompletionEvent,
    ) -> Result<EventOutcome, EngineError> {
        let txn = self.load_transaction(ctx.owner.id()).await?;
        if txn.status == TransactionStatus::Failed {
            return self.cancel(&ctx).await;
        }
        if txn.status != expected {
            tracing::debug!(
                job_id = %ctx.job_id,
                transaction_id = %txn.id,
                current = %txn.status,
                expected = %expected,
                "event already applied"
            );
            return Ok(EventOutcome::AlreadyApplied);
        }

        match FailureKind::from_status_code(event.status_code) {
            None => self.advance_transaction(ctx, &txn, event).await,
            Some(kind) => self.transaction_failure(ctx, &txn, kind, event).await,
        }
    }

    async fn advance_transaction(
        &self,
        mut ctx: JobContext,
        txn: &Transaction,
        event: CompletionEvent,
    ) -> Result<EventOutcome, EngineError> {
        match ctx.topic {
            StageTopic::EmailBatchQueued | StageTopic::TrainBatchQueued => {
                self.split_transaction(ctx, txn, event.body).await
            }
            StageTopic::AssemblyQueued => {
                self.store.set_assembled_results(&txn.id, event.body.clone()).await?;
                if !self
                    .transaction_cas(&txn.id, TransactionStatus::Assembling, TransactionStatus::CallingApi)
                    .await?
                {
                    return Ok(EventOutcome::AlreadyApplied);
                }
                ctx.record_result(&event.body);
                self.record(&txn.id, TransactionStatus::CallingApi, "assembly completed", None)
                    .await;
                self.forward_transaction(ctx, &txn.id, TransactionStatus::CallingApi, false)
                    .await?;
                Ok(EventOutcome::Advanced)
            }
            StageTopic::ApiCallQueued => {
                let next = if txn.options.doc_upload_enabled {
                    TransactionStatus::UploadingDocuments
                } else {
                    TransactionStatus::Completed
                };
                if !self
                    .transaction_cas(&txn.id, TransactionStatus::CallingApi, next)
                    .await?
                {
                    return Ok(EventOutcome::AlreadyApplied);
                }
                self.push_outbound(&ctx, &txn.id, &event).await?;
                if next == TransactionStatus::Completed {
                    self.finish_transaction(&ctx, &txn.id).await?;
                } else {
                    self.record(
                        &txn.id,
                        next,
                        format!("api call delivered with status {}", event.status_code),
                        non_null(event.body.clone()),
                    )
                    .await;
                    ctx.record_result(&event.body);
                    self.forward_transaction(ctx, &txn.id, next, false).await?;
                }
                Ok(EventOutcome::Advanced)
            }
            StageTopic::DocUploadQueued => {
                if !self
                    .transaction_cas(&txn.id, TransactionStatus::UploadingDocuments, TransactionStatus::Completed)
                    .await?
                {
                    return Ok(EventOutcome::AlreadyApplied);
                }
                self.finish_transaction(&ctx, &txn.id).await?;
                Ok(EventOutcome::Advanced)
            }
            other => {
                tracing::warn!(job_id = %ctx.job_id, topic = %other, "unexpected transaction-level topic");
                self.discard(&ctx.job_id).await;
                Ok(EventOutcome::AlreadyApplied)
            }
        }
    }

    // Create the child batches named by the split stage, then fan out their
    // first stage. All links exist before any child is dispatched, so an early
    // finisher can never see a partial sibling set at the join.
    async fn split_transaction(
        &self,
        ctx: JobContext,
        txn: &Transaction,
        body: Value,
    ) -> Result<EventOutcome, EngineError> {
        let split = match serde_json::from_value::<SplitResult>(body.clone()) {
            Ok(split) => split,
            Err(err) => {
                self.fail_transaction(&txn.id, &format!("malformed split result: {err}"), non_null(body))
                    .await?;
                self.discard(&ctx.job_id).await;
                return Ok(EventOutcome::Failed);
            }
        };
        if split.batches.is_empty() {
            self.fail_transaction(&txn.id, "no processing documents", None).await?;
            self.discard(&ctx.job_id).await;
            return Ok(EventOutcome::Failed);
        }
        if !self
            .transaction_cas(&txn.id, TransactionStatus::Received, TransactionStatus::Preprocessing)
            .await?
        {
            return Ok(EventOutcome::AlreadyApplied);
        }
        self.record(
            &txn.id,
            TransactionStatus::Preprocessing,
            format!("split into {} batches", split.batches.len()),
            None,
        )
        .await;

        let mut children = Vec::with_capacity(split.batches.len());
        for item in split.batches {
            let mode = item.mode.unwrap_or(txn.kind.default_batch_mode());
            let batch = Batch::new(&item.batch_id, mode, item.format).with_parent(&txn.id);
            tolerate_duplicate(self.store.insert_batch(batch).await)?;
            tolerate_duplicate(self.store.insert_link(Link::uploaded(&txn.id, &item.batch_id, mode)).await)?;
            self.record(
                &item.batch_id,
                BatchStatus::Uploading,
                format!("batch received for transaction {}", txn.id),
                None,
            )
            .await;
            children.push(item.batch_id);
        }

        for batch_id in &children {
            let child = JobContext::for_batch(
                batch_id,
                Some(&txn.id),
                BatchStatus::Uploading,
                StageTopic::PreClassificationProcessQueued,
                txn.options,
            );
            self.hand_off(None, child).await?;
        }
        self.discard(&ctx.job_id).await;
        tracing::info!(transaction_id = %txn.id, batches = children.len(), "transaction split");
        Ok(EventOutcome::Advanced)
    }

    async fn redispatch_uploads(&self, txn: &Transaction) -> Result<(), EngineError> {
        for link in self.store.links(&txn.id).await? {
            let Some(batch) = self.store.batch(&link.batch_id).await? else {
                continue;
            };
            if batch.status != BatchStatus::Uploading {
                continue;
            }
            let child = JobContext::for_batch(
                &batch.id,
                Some(&txn.id),
                BatchStatus::Uploading,
                StageTopic::PreClassificationProcessQueued,
                txn.options,
            );
            self.hand_off(None, child).await?;
        }
        Ok(())
    }

    // Acquire the guard for the action owed in `status` and dispatch it. When
    // resuming, a flag already held by the interrupted attempt is accepted.
    async fn forward_transaction(
        &self,
        ctx: JobContext,
        transaction_id: &str,
        status: TransactionStatus,
        resuming: bool,
    ) -> Result<(), EngineError> {
        let (topic, flag) = match status {
            TransactionStatus::CallingApi => (StageTopic::ApiCallQueued, TriggerFlag::ApiCall),
            TransactionStatus::UploadingDocuments => (StageTopic::DocUploadQueued, TriggerFlag::DocUpload),
            _ => {
                self.discard(&ctx.job_id).await;
                return Ok(());
            }
        };
        if !self.guard.try_acquire(transaction_id, flag).await? && !resuming {
            tracing::info!(transaction_id, flag = %flag, "action already triggered");
            self.discard(&ctx.job_id).await;
            return Ok(());
        }
        let next = ctx.next_stage(Checkpoint::Transaction(status), topic);
        self.hand_off(Some(&ctx), next).await
    }

    async fn finish_transaction(&self, ctx: &JobContext, transaction_id: &str) -> Result<(), EngineError> {
        for link in self.store.links(transaction_id).await? {
            if self
                .store
                .compare_and_set_batch_status(&link.batch_id, BatchStatus::Assembling, BatchStatus::Completed)
                .await?
            {
                self.record(&link.batch_id, BatchStatus::Completed, "transaction delivered", None)
                    .await;
            }
        }
        self.record(transaction_id, TransactionStatus::Completed, "transaction completed", None)
            .await;
        self.announce(transaction_id, NotificationOutcome::Success, "transaction completed")
            .await;
        self.discard(&ctx.job_id).await;
        tracing::info!(transaction_id, "transaction completed");
        Ok(())
    }

    async fn transaction_failure(
        &self,
        ctx: JobContext,
        txn: &Transaction,
        kind: FailureKind,
        event: CompletionEvent,
    ) -> Result<EventOutcome, EngineError> {
        let flag = TriggerFlag::for_topic(ctx.topic);

        if kind.is_retryable() && self.settings.retry.allows_retry(ctx.attempt) {
            // Only the caller that releases the flag schedules the retry.
            if let Some(flag) = flag
                && !self.guard.release(&txn.id, flag).await?
            {
                return Ok(EventOutcome::AlreadyApplied);
            }
            self.push_outbound(&ctx, &txn.id, &event).await?;
            let guard = flag.map(|flag| (txn.id.clone(), flag));
            return self.schedule_retry(&ctx, guard, &event).await;
        }

        self.push_outbound(&ctx, &txn.id, &event).await?;
        let reason = failure_reason(&ctx, &event, kind);
        self.fail_transaction(&txn.id, &reason, non_null(event.body)).await?;
        self.discard(&ctx.job_id).await;
        Ok(EventOutcome::Failed)
    }

    async fn schedule_retry(
        &self,
        ctx: &JobContext,
        guard: Option<(String, TriggerFlag)>,
        event: &CompletionEvent,
    ) -> Result<EventOutcome, EngineError> {
        let owner_id = ctx.owner.id();
        let next = ctx.retry();
        let interval = self.settings.retry.retry_interval;

        // Creating the next attempt's context is the claim on this retry.
        match self.contexts.put_if_absent(&next).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    job_id = %ctx.job_id,
                    retry_job_id = %next.job_id,
                    "retry already claimed by a concurrent delivery"
                );
                return Ok(EventOutcome::AlreadyApplied);
            }
            Err(err) => {
                tracing::error!(job_id = %next.job_id, error = %err, "could not store retry context");
                self.fail_owner(&ctx.owner, &format!("job context store unavailable: {err}"))
                    .await?;
                return Err(err.into());
            }
        }
        self.discard(&ctx.job_id).await;

        self.record(
            owner_id,
            "transient_failure",
            format!("{} failed with status {}", ctx.topic, event.status_code),
            non_null(event.body.clone()),
        )
        .await;
        self.record(
            owner_id,
            "retry_scheduled",
            format!(
                "retry {}/{} of {} in {:?}",
                next.attempt, self.settings.retry.max_retries, ctx.topic, interval
            ),
            None,
        )
        .await;
        tracing::warn!(
            job_id = %ctx.job_id,
            retry_job_id = %next.job_id,
            topic = %ctx.topic,
            status_code = event.status_code,
            attempt = next.attempt,
            "transient failure, retry scheduled"
        );

        let retry = ScheduledRetry {
            topic: next.topic,
            request: next.request(),
            guard,
        };
        if let Err(err) = self.retries.schedule_retry(retry, interval).await {
            self.discard(&next.job_id).await;
            self.fail_owner(&ctx.owner, &format!("retry could not be scheduled: {err}"))
                .await?;
            return Err(err.into());
        }
        Ok(EventOutcome::RetryScheduled { attempt: next.attempt })
    }

    async fn evaluate_join(&self, transaction_id: &str, join: JoinPoint) -> Result<(), EngineError> {
        let txn = self.load_transaction(transaction_id).await?;
        if txn.status.is_terminal() {
            return Ok(());
        }
        match self.barrier.evaluate(transaction_id, join).await? {
            BarrierDecision::Pending { arrived, failed, total } => {
                tracing::debug!(transaction_id, join = %join, arrived, failed, total, "join pending");
                Ok(())
            }
            BarrierDecision::Empty => {
                self.fail_transaction(transaction_id, &format!("no uploaded batches at join {join}"), None)
                    .await
            }
            BarrierDecision::Fail { failed, total } => {
                self.fail_transaction(transaction_id, &format!("{failed} of {total} batches failed"), None)
                    .await
            }
            BarrierDecision::Proceed { batch_ids, failed } => self.trigger_join(&txn, join, batch_ids, failed).await,
        }
    }

    fn reevaluate_join<'a>(&'a self, transaction_id: &'a str, join: JoinPoint) -> JoinFuture<'a> {
        Box::pin(self.evaluate_join(transaction_id, join))
    }

    async fn trigger_join(
        &self,
        txn: &Transaction,
        join: JoinPoint,
        batch_ids: Vec<String>,
        failed: usize,
    ) -> Result<(), EngineError> {
        let remarks = (failed > 0).then(|| json!({ "failed_batches": failed }));
        match join {
            JoinPoint::Preprocessed => {
                if !self
                    .claim(
                        txn,
                        TriggerFlag::Processing,
                        TransactionStatus::Preprocessing,
                        TransactionStatus::Processing,
                    )
                    .await?
                {
                    return Ok(());
                }
                self.record(
                    &txn.id,
                    TransactionStatus::Processing,
                    format!("{} batches preprocessed", batch_ids.len()),
                    remarks,
                )
                .await;
                for batch_id in &batch_ids {
                    let ctx = JobContext::for_batch(
                        batch_id,
                        Some(&txn.id),
                        BatchStatus::Queued,
                        StageTopic::BatchQueued,
                        txn.options,
                    );
                    self.hand_off(None, ctx).await?;
                }
            }
            JoinPoint::OutputReady => {
                if !self
                    .claim(
                        txn,
                        TriggerFlag::Assembly,
                        TransactionStatus::Processing,
                        TransactionStatus::Assembling,
                    )
                    .await?
                {
                    return Ok(());
                }
                self.record(
                    &txn.id,
                    TransactionStatus::Assembling,
                    format!("{} batches ready for assembly", batch_ids.len()),
                    remarks,
                )
                .await;
                let mut ctx = JobContext::for_transaction(
                    &txn.id,
                    TransactionStatus::Assembling,
                    StageTopic::AssemblyQueued,
                    txn.options,
                );
                ctx.handles["batch_ids"] = json!(batch_ids);
                self.hand_off(None, ctx).await?;
            }
            JoinPoint::Completed => {
                if !self
                    .transaction_cas(&txn.id, TransactionStatus::Processing, TransactionStatus::Completed)
                    .await?
                {
                    return Ok(());
                }
                self.record(
                    &txn.id,
                    TransactionStatus::Completed,
                    format!("{} training batches completed", batch_ids.len()),
                    remarks,
                )
                .await;
                self.announce(&txn.id, NotificationOutcome::Success, "training completed")
                    .await;
            }
        }
        tracing::info!(transaction_id = %txn.id, join = %join, batches = batch_ids.len(), "join triggered");
        Ok(())
    }

    // Guard plus status change; the guard is given back if the status moved.
    async fn claim(
        &self,
        txn: &Transaction,
        flag: TriggerFlag,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool, EngineError> {
        if !self.guard.try_acquire(&txn.id, flag).await? {
            return Ok(false);
        }
        if self.transaction_cas(&txn.id, from, to).await? {
            return Ok(true);
        }
        self.guard.release(&txn.id, flag).await?;
        Ok(false)
    }

    async fn fail_owner(&self, owner: &JobOwner, reason: &str) -> Result<(), EngineError> {
        match owner {
            JobOwner::Batch {
                batch_id,
                transaction_id,
            } => {
                self.fail_batch(batch_id, transaction_id.as_deref(), reason, None)
                    .await
            }
            JobOwner::Transaction { transaction_id } => self.fail_transaction(transaction_id, reason, None).await,
        }
    }

    async fn fail_batch(
        &self,
        batch_id: &str,
        transaction_id: Option<&str>,
        reason: &str,
        remarks: Option<Value>,
    ) -> Result<(), EngineError> {
        let Some(previous) = self.store.fail_batch(batch_id).await? else {
            tracing::debug!(batch_id, "batch already terminal");
            return Ok(());
        };
        tracing::warn!(batch_id, from = %previous, reason, "batch failed");
        self.record(batch_id, BatchStatus::Failed, reason, remarks).await;

        if let Some(transaction_id) = transaction_id {
            self.on_sibling_failed(transaction_id, batch_id).await?;
        }
        Ok(())
    }

    async fn on_sibling_failed(&self, transaction_id: &str, batch_id: &str) -> Result<(), EngineError> {
        let txn = self.load_transaction(transaction_id).await?;
        if txn.status.is_terminal() {
            return Ok(());
        }
        match self.settings.partial_policy {
            PartialPolicy::FailTransaction => {
                self.fail_transaction(transaction_id, &format!("batch {batch_id} failed"), None)
                    .await
            }
            PartialPolicy::ProceedWithPartial => {
                let join = match (txn.status, txn.kind) {
                    (TransactionStatus::Preprocessing, _) => JoinPoint::Preprocessed,
                    (TransactionStatus::Processing, TransactionKind::Processing) => JoinPoint::OutputReady,
                    (TransactionStatus::Processing, TransactionKind::Training) => JoinPoint::Completed,
                    _ => return Ok(()),
                };
                self.record(
                    transaction_id,
                    txn.status,
                    format!("batch {batch_id} failed, continuing with the remaining batches"),
                    None,
                )
                .await;
                self.reevaluate_join(transaction_id, join).await
            }
        }
    }

    async fn fail_transaction(
        &self,
        transaction_id: &str,
        reason: &str,
        remarks: Option<Value>,
    ) -> Result<(), EngineError> {
        let Some(previous) = self.store.fail_transaction(transaction_id).await? else {
            tracing::debug!(transaction_id, "transaction already terminal");
            return Ok(());
        };
        tracing::warn!(transaction_id, from = %previous, reason, "transaction failed");

        for flag in TriggerFlag::ALL {
            self.guard.release(transaction_id, flag).await?;
        }
        self.record(transaction_id, TransactionStatus::Failed, reason, remarks)
            .await;

        for link in self.store.links(transaction_id).await? {
            if self.store.fail_batch(&link.batch_id).await?.is_some() {
                self.record(
                    &link.batch_id,
                    BatchStatus::Failed,
                    format!("transaction {transaction_id} failed"),
                    None,
                )
                .await;
            }
        }
        self.announce(transaction_id, NotificationOutcome::Failure, reason)
            .await;
        Ok(())
    }

    // Store the next context, publish it, then drop the previous one. A failed
    // store or publish fails the owner.
    async fn hand_off(&self, previous: Option<&JobContext>, next: JobContext) -> Result<(), EngineError> {
        if let Err(err) = self.contexts.put(&next).await {
            tracing::error!(job_id = %next.job_id, error = %err, "could not store job context");
            self.fail_owner(&next.owner, &format!("job context store unavailable: {err}"))
                .await?;
            return Err(err.into());
        }
        if let Err(err) = self.gateway.dispatch(next.topic, next.request()).await {
            tracing::error!(job_id = %next.job_id, topic = %next.topic, error = %err, "dispatch failed");
            self.discard(&next.job_id).await;
            self.fail_owner(&next.owner, &format!("dispatch to {} failed: {err}", next.topic))
                .await?;
            return Err(err.into());
        }
        tracing::debug!(job_id = %next.job_id, topic = %next.topic, owner_id = next.owner.id(), "stage dispatched");

        if let Some(previous) = previous
            && previous.job_id != next.job_id
        {
            self.discard(&previous.job_id).await;
        }
        Ok(())
    }

    async fn cancel(&self, ctx: &JobContext) -> Result<EventOutcome, EngineError> {
        tracing::info!(job_id = %ctx.job_id, owner_id = ctx.owner.id(), "owner failed, dropping pending step");
        self.discard(&ctx.job_id).await;
        Ok(EventOutcome::Cancelled)
    }

    async fn push_outbound(&self, ctx: &JobContext, transaction_id: &str, event: &CompletionEvent) -> Result<(), EngineError> {
        if ctx.topic != StageTopic::ApiCallQueued {
            return Ok(());
        }
        let result = OutboundResult {
            attempt: ctx.attempt,
            status_code: event.status_code,
            body: event.body.clone(),
            recorded_at: Utc::now(),
        };
        self.store.push_outbound_result(transaction_id, result).await?;
        Ok(())
    }

    async fn batch_scope(&self, batch_id: &str) -> Result<BatchScope, EngineError> {
        let batch = self
            .store
            .batch(batch_id)
            .await?
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.to_string()))?;
        let parent = match &batch.parent {
            Some(transaction_id) => Some(self.load_transaction(transaction_id).await?),
            None => None,
        };
        let route = BatchRoute {
            mode: batch.mode,
            format: batch.format,
            parent: parent.as_ref().map(|txn| txn.kind),
        };
        let cancelled = batch.status == BatchStatus::Failed
            || parent.is_some_and(|txn| txn.status == TransactionStatus::Failed);
        Ok(BatchScope { batch, route, cancelled })
    }

    async fn load_transaction(&self, transaction_id: &str) -> Result<Transaction, EngineError> {
        self.store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EngineError::TransactionNotFound(transaction_id.to_string()))
    }

    async fn transaction_cas(
        &self,
        transaction_id: &str,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool, EngineError> {
        let applied = self
            .store
            .compare_and_set_transaction_status(transaction_id, from, to)
            .await?;
        if applied {
            tracing::info!(transaction_id, from = %from, to = %to, "transaction advanced");
        }
        Ok(applied)
    }

    async fn record(&self, owner_id: &str, status: impl fmt::Display, message: impl AsRef<str>, remarks: Option<Value>) {
        let status = status.to_string();
        if let Err(err) = self
            .audit
            .write_audit_entry(owner_id, &status, message.as_ref(), remarks)
            .await
        {
            tracing::warn!(owner_id, status = %status, error = %err, "audit write failed");
        }
    }

    async fn announce(&self, transaction_id: &str, outcome: NotificationOutcome, detail: &str) {
        if let Err(err) = self.audit.notify(transaction_id, outcome, detail).await {
            tracing::error!(transaction_id, outcome = %outcome, error = %err, "notification failed");
        }
    }

    async fn discard(&self, job_id: &str) {
        if let Err(err) = self.contexts.delete(job_id).await {
            tracing::warn!(job_id, error = %err, "could not delete job context");
        }
    }
}

fn failure_reason(ctx: &JobContext, event: &CompletionEvent, kind: FailureKind) -> String {
    match kind {
        FailureKind::Terminal => format!("{} rejected with status {}", ctx.topic, event.status_code),
        FailureKind::Transient => format!(
            "{} failed with status {} after {} retries",
            ctx.topic, event.status_code, ctx.attempt
        ),
    }
}

fn non_null(body: Value) -> Option<Value> {
    (!body.is_null()).then_some(body)
}

fn tolerate_duplicate(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(StoreError::Duplicate(id)) => {
            tracing::warn!(id = %id, "record already exists, reusing it");
            Ok(())
        }
        other => other,
    }
}
