//! Fan-in barrier: decides whether a transaction may pass a join point given
//! the statuses of its uploaded, linked batches.
//!
//! The barrier only reads. The decision to act is made race-free by the caller
//! through the trigger guard or a status compare-and-set, so several batches
//! observing "all settled" at the same instant still trigger one action.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::state_machine::BatchStatus;
use crate::store::EntityStore;

/// The three places a transaction waits for its batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPoint {
    /// Every batch finished per-document preprocessing; classification may start.
    Preprocessed,
    /// Every batch rendered output and is waiting for assembly.
    OutputReady,
    /// Every batch of a training transaction completed.
    Completed,
}

impl JoinPoint {
    /// Status a batch must hold to count as arrived at this join.
    pub fn target(self) -> BatchStatus {
        match self {
            JoinPoint::Preprocessed => BatchStatus::Queued,
            JoinPoint::OutputReady => BatchStatus::Assembling,
            JoinPoint::Completed => BatchStatus::Completed,
        }
    }
}

impl fmt::Display for JoinPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinPoint::Preprocessed => write!(f, "preprocessed"),
            JoinPoint::OutputReady => write!(f, "output_ready"),
            JoinPoint::Completed => write!(f, "completed"),
        }
    }
}

/// What a failed sibling means for the rest of the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialPolicy {
    /// Any failed batch fails the whole transaction.
    #[default]
    FailTransaction,
    /// Failed batches are dropped; the rest continue.
    ProceedWithPartial,
}

/// Outcome of one barrier evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierDecision {
    /// Some batches have not settled yet.
    Pending { arrived: usize, failed: usize, total: usize },
    /// Every batch arrived (or, under the partial policy, arrived or failed).
    Proceed { batch_ids: Vec<String>, failed: usize },
    /// Settled, but the failures rule out advancing.
    Fail { failed: usize, total: usize },
    /// No uploaded batches are linked at all.
    Empty,
}

#[derive(Clone)]
pub struct FanInBarrier {
    store: Arc<dyn EntityStore>,
    policy: PartialPolicy,
}

impl FanInBarrier {
    pub fn new(store: Arc<dyn EntityStore>, policy: PartialPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> PartialPolicy {
        self.policy
    }

    /// Compare the linked-and-uploaded count against the settled count.
    ///
    /// Failed batches count as settled so a broken sibling cannot starve the
    /// join. `Proceed` lists the ids of batches that actually arrived.
    pub async fn evaluate(&self, transaction_id: &str, join: JoinPoint) -> Result<BarrierDecision, StoreError> {
        let links = self.store.links(transaction_id).await?;
        let target = join.target();

        let mut total = 0;
        let mut arrived = Vec::new();
        let mut failed = 0;
        for link in links.iter().filter(|l| l.uploaded) {
            total += 1;
            let Some(batch) = self.store.batch(&link.batch_id).await? else {
                continue;
            };
            if batch.status == target {
                arrived.push(batch.id);
            } else if batch.status == BatchStatus::Failed {
                failed += 1;
            }
        }

        let decision = if total == 0 {
            BarrierDecision::Empty
        } else if arrived.len() + failed < total {
            BarrierDecision::Pending {
                arrived: arrived.len(),
                failed,
                total,
            }
        } else if failed == total
            || (failed > 0 && self.policy == PartialPolicy::FailTransaction)
        {
            BarrierDecision::Fail { failed, total }
        } else {
            BarrierDecision::Proceed {
                batch_ids: arrived,
                failed,
            }
        };

        tracing::debug!(transaction_id, join = %join, decision = ?decision, "barrier evaluated");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Batch, BatchMode, DocumentFormat, Link};
    use crate::store::InMemoryEntityStore;

    async fn seed(statuses: &[BatchStatus]) -> Arc<InMemoryEntityStore> {
        let store = Arc::new(InMemoryEntityStore::new());
        for (n, status) in statuses.iter().enumerate() {
            let id = format!("B{n}");
            let mut batch = Batch::new(&id, BatchMode::Processing, DocumentFormat::Document).with_parent("T1");
            batch.status = *status;
            store.insert_batch(batch).await.unwrap();
            store
                .insert_link(Link::uploaded("T1", &id, BatchMode::Processing))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn pending_until_every_batch_arrives() {
        use BatchStatus::*;
        let store = seed(&[Assembling, Assembling, PostProcessing]).await;
        let barrier = FanInBarrier::new(store, PartialPolicy::FailTransaction);
        assert_eq!(
            barrier.evaluate("T1", JoinPoint::OutputReady).await.unwrap(),
            BarrierDecision::Pending {
                arrived: 2,
                failed: 0,
                total: 3
            }
        );
    }

    #[tokio::test]
    async fn proceeds_when_counts_match() {
        use BatchStatus::*;
        let store = seed(&[Assembling, Assembling, Assembling]).await;
        let barrier = FanInBarrier::new(store, PartialPolicy::FailTransaction);
        match barrier.evaluate("T1", JoinPoint::OutputReady).await.unwrap() {
            BarrierDecision::Proceed { batch_ids, failed } => {
                assert_eq!(batch_ids.len(), 3);
                assert_eq!(failed, 0);
            }
            other => panic!("expected Proceed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_sibling_settles_the_join() {
        use BatchStatus::*;
        let store = seed(&[Queued, Failed, Queued]).await;

        let strict = FanInBarrier::new(store.clone(), PartialPolicy::FailTransaction);
        assert_eq!(
            strict.evaluate("T1", JoinPoint::Preprocessed).await.unwrap(),
            BarrierDecision::Fail { failed: 1, total: 3 }
        );

        let lenient = FanInBarrier::new(store, PartialPolicy::ProceedWithPartial);
        assert_eq!(
            lenient.evaluate("T1", JoinPoint::Preprocessed).await.unwrap(),
            BarrierDecision::Proceed {
                batch_ids: vec!["B0".into(), "B2".into()],
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn all_failed_always_fails() {
        use BatchStatus::*;
        let store = seed(&[Failed, Failed]).await;
        let barrier = FanInBarrier::new(store, PartialPolicy::ProceedWithPartial);
        assert_eq!(
            barrier.evaluate("T1", JoinPoint::Completed).await.unwrap(),
            BarrierDecision::Fail { failed: 2, total: 2 }
        );
    }

    #[tokio::test]
    async fn links_not_uploaded_are_ignored() {
        use BatchStatus::*;
        let store = seed(&[Completed]).await;
        store
            .insert_link(Link {
                transaction_id: "T1".into(),
                batch_id: "B-excel".into(),
                classified: true,
                uploaded: false,
                mode: BatchMode::Processing,
            })
            .await
            .unwrap();
        let barrier = FanInBarrier::new(store, PartialPolicy::FailTransaction);
        assert!(matches!(
            barrier.evaluate("T1", JoinPoint::Completed).await.unwrap(),
            BarrierDecision::Proceed { .. }
        ));
    }

    #[tokio::test]
    async fn no_links_is_empty() {
        let store = Arc::new(InMemoryEntityStore::new());
        let barrier = FanInBarrier::new(store, PartialPolicy::FailTransaction);
        assert_eq!(
            barrier.evaluate("T1", JoinPoint::Preprocessed).await.unwrap(),
            BarrierDecision::Empty
        );
    }

    #[test]
    fn join_targets() {
        assert_eq!(JoinPoint::Preprocessed.target(), BatchStatus::Queued);
        assert_eq!(JoinPoint::OutputReady.target(), BatchStatus::Assembling);
        assert_eq!(JoinPoint::Completed.target(), BatchStatus::Completed);
    }
}
