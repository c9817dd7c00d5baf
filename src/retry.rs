//! Delayed re-enqueue of stage requests after a retryable failure.
//!
//! A retry that cannot go out when its timer fires is reported as a
//! [`RetryFailure`] so the owner can be failed instead of left waiting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::gateway::{StageGateway, StageRequest};
use crate::guard::TriggerGuard;
use crate::model::TriggerFlag;
use crate::topic::StageTopic;

/// A request waiting for its retry delay to elapse.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRetry {
    pub topic: StageTopic,
    pub request: StageRequest,
    /// Guard flag (transaction id, flag) the retry must re-acquire before it
    /// dispatches. The caller released it before scheduling.
    pub guard: Option<(String, TriggerFlag)>,
}

/// Why a fired retry did not reach its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailureCause {
    /// Another attempt holds the guard flag and already dispatched the action.
    GuardTaken,
    /// The guard flag could not be read or written.
    Guard(String),
    Dispatch(String),
}

impl fmt::Display for RetryFailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GuardTaken => write!(f, "guard taken by another attempt"),
            Self::Guard(err) => write!(f, "guard unavailable: {err}"),
            Self::Dispatch(err) => write!(f, "dispatch failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub job_id: String,
    pub topic: StageTopic,
    pub cause: RetryFailureCause,
}

#[async_trait]
pub trait RetryScheduler: Send + Sync {
    async fn schedule_retry(&self, retry: ScheduledRetry, delay: Duration) -> Result<(), GatewayError>;
}

/// Timer-based scheduler: each retry is a tokio task that sleeps, re-acquires
/// its guard and dispatches through the gateway.
pub struct TokioRetryScheduler {
    gateway: Arc<dyn StageGateway>,
    guard: TriggerGuard,
    failures: Option<mpsc::UnboundedSender<RetryFailure>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioRetryScheduler {
    pub fn new(gateway: Arc<dyn StageGateway>, guard: TriggerGuard) -> Self {
        Self {
            gateway,
            guard,
            failures: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Send every retry that fails to go out to `failures`. Without a
    /// receiver such failures are only logged.
    pub fn report_failures(mut self, failures: mpsc::UnboundedSender<RetryFailure>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Number of retries whose timer has not fired yet.
    pub fn in_flight(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|handle| !handle.is_finished());
        pending.len()
    }

    /// Wait for every scheduled retry to fire.
    pub async fn drain(&self) {
        loop {
            let batch: Vec<_> = std::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                if let Err(err) = handle.await {
                    tracing::error!(error = %err, "retry task panicked");
                }
            }
        }
    }
}

async fn fire(
    gateway: Arc<dyn StageGateway>,
    guard: TriggerGuard,
    retry: ScheduledRetry,
) -> Result<(), RetryFailureCause> {
    let ScheduledRetry { topic, request, guard: flag } = retry;

    if let Some((transaction_id, flag)) = &flag {
        match guard.try_acquire(transaction_id, *flag).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    job_id = %request.job_id,
                    transaction_id = %transaction_id,
                    flag = %flag,
                    "retry dropped, guard taken by another attempt"
                );
                return Err(RetryFailureCause::GuardTaken);
            }
            Err(err) => {
                tracing::error!(job_id = %request.job_id, error = %err, "retry could not re-acquire guard");
                return Err(RetryFailureCause::Guard(err.to_string()));
            }
        }
    }

    let job_id = request.job_id.clone();
    if let Err(err) = gateway.dispatch(topic, request).await {
        tracing::error!(job_id = %job_id, topic = %topic, error = %err, "retry dispatch failed");
        if let Some((transaction_id, flag)) = flag
            && let Err(err) = guard.release(&transaction_id, flag).await
        {
            tracing::error!(job_id = %job_id, error = %err, "failed to release guard after retry dispatch error");
        }
        return Err(RetryFailureCause::Dispatch(err.to_string()));
    }
    tracing::info!(job_id = %job_id, topic = %topic, "retry dispatched");
    Ok(())
}

#[async_trait]
impl RetryScheduler for TokioRetryScheduler {
    async fn schedule_retry(&self, retry: ScheduledRetry, delay: Duration) -> Result<(), GatewayError> {
        tracing::info!(
            job_id = %retry.request.job_id,
            topic = %retry.topic,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        let gateway = Arc::clone(&self.gateway);
        let guard = self.guard.clone();
        let failures = self.failures.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let job_id = retry.request.job_id.clone();
            let topic = retry.topic;
            if let Err(cause) = fire(gateway, guard, retry).await
                && let Some(failures) = failures
                && failures.send(RetryFailure { job_id, topic, cause }).is_err()
            {
                tracing::error!(topic = %topic, "retry failure receiver closed");
            }
        });

        let mut pending = self.pending.lock();
        pending.retain(|handle| !handle.is_finished());
        pending.push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ChannelGateway;
    use crate::model::{Transaction, TransactionKind};
    use crate::store::{EntityStore, InMemoryEntityStore};
    use serde_json::json;
    use tokio::time::Instant;

    async fn setup() -> (
        TokioRetryScheduler,
        TriggerGuard,
        tokio::sync::mpsc::UnboundedReceiver<crate::gateway::StageEnvelope>,
    ) {
        let store = Arc::new(InMemoryEntityStore::new());
        store
            .insert_transaction(Transaction::new("T1", TransactionKind::Processing))
            .await
            .unwrap();
        let guard = TriggerGuard::new(store);
        let (gateway, rx) = ChannelGateway::new();
        (TokioRetryScheduler::new(Arc::new(gateway), guard.clone()), guard, rx)
    }

    fn retry(guard: Option<(String, TriggerFlag)>) -> ScheduledRetry {
        ScheduledRetry {
            topic: StageTopic::ApiCallQueued,
            request: StageRequest {
                job_id: "job:api_call_queued:T1:1".into(),
                body: json!({"attempt": 1}),
            },
            guard,
        }
    }

    #[tokio::test]
    async fn dispatches_after_the_delay() {
        let (scheduler, _guard, mut rx) = setup().await;
        let started = Instant::now();
        scheduler
            .schedule_retry(retry(None), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        let envelope = rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(envelope.topic, StageTopic::ApiCallQueued);
        assert_eq!(envelope.request.job_id, "job:api_call_queued:T1:1");
    }

    #[tokio::test]
    async fn reacquires_the_released_guard() {
        let (scheduler, guard, mut rx) = setup().await;
        scheduler
            .schedule_retry(
                retry(Some(("T1".into(), TriggerFlag::ApiCall))),
                Duration::from_millis(5),
            )
            .await
            .unwrap();
        scheduler.drain().await;

        assert!(rx.recv().await.is_some());
        assert!(guard.is_held("T1", TriggerFlag::ApiCall).await.unwrap());
    }

    #[tokio::test]
    async fn drops_the_retry_when_guard_is_taken() {
        let (scheduler, guard, mut rx) = setup().await;
        let (tx, mut failures) = mpsc::unbounded_channel();
        let scheduler = scheduler.report_failures(tx);
        assert!(guard.try_acquire("T1", TriggerFlag::ApiCall).await.unwrap());
        scheduler
            .schedule_retry(
                retry(Some(("T1".into(), TriggerFlag::ApiCall))),
                Duration::from_millis(5),
            )
            .await
            .unwrap();
        scheduler.drain().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.in_flight(), 0);
        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.job_id, "job:api_call_queued:T1:1");
        assert_eq!(failure.cause, RetryFailureCause::GuardTaken);
    }

    #[tokio::test]
    async fn failed_dispatch_releases_the_guard_and_reports() {
        let (scheduler, guard, rx) = setup().await;
        let (tx, mut failures) = mpsc::unbounded_channel();
        let scheduler = scheduler.report_failures(tx);
        drop(rx);
        scheduler
            .schedule_retry(
                retry(Some(("T1".into(), TriggerFlag::ApiCall))),
                Duration::from_millis(1),
            )
            .await
            .unwrap();
        scheduler.drain().await;

        assert!(!guard.is_held("T1", TriggerFlag::ApiCall).await.unwrap());
        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.topic, StageTopic::ApiCallQueued);
        assert!(matches!(failure.cause, RetryFailureCause::Dispatch(_)));
    }

    #[tokio::test]
    async fn successful_retry_reports_nothing() {
        let (scheduler, _guard, mut rx) = setup().await;
        let (tx, mut failures) = mpsc::unbounded_channel();
        let scheduler = scheduler.report_failures(tx);
        scheduler
            .schedule_retry(retry(None), Duration::from_millis(1))
            .await
            .unwrap();
        scheduler.drain().await;

        assert!(rx.try_recv().is_ok());
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn finished_retries_are_pruned_on_schedule() {
        let (scheduler, _guard, _rx) = setup().await;
        for _ in 0..3 {
            scheduler
                .schedule_retry(retry(None), Duration::ZERO)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler
            .schedule_retry(retry(None), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(scheduler.pending.lock().len(), 1);
    }
}
