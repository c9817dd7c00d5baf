//! At-most-once execution of transaction-level side effects.
//!
//! Acquire and release are single compare-and-set operations on the durable
//! transaction record; there is no read-then-write window.

use std::sync::Arc;

use crate::error::StoreError;
use crate::model::TriggerFlag;
use crate::store::EntityStore;

#[derive(Clone)]
pub struct TriggerGuard {
    store: Arc<dyn EntityStore>,
}

impl TriggerGuard {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Flip `flag` from false to true. Only one caller ever sees `true` until
    /// the flag is released again.
    pub async fn try_acquire(&self, transaction_id: &str, flag: TriggerFlag) -> Result<bool, StoreError> {
        let acquired = self
            .store
            .compare_and_set_flag(transaction_id, flag, false, true)
            .await?;
        if acquired {
            tracing::debug!(transaction_id, flag = %flag, "trigger guard acquired");
        } else {
            tracing::debug!(transaction_id, flag = %flag, "trigger guard already held");
        }
        Ok(acquired)
    }

    /// Clear `flag` so a scheduled retry can acquire it again. Returns whether
    /// the flag was held.
    pub async fn release(&self, transaction_id: &str, flag: TriggerFlag) -> Result<bool, StoreError> {
        let released = self
            .store
            .compare_and_set_flag(transaction_id, flag, true, false)
            .await?;
        if released {
            tracing::debug!(transaction_id, flag = %flag, "trigger guard released");
        }
        Ok(released)
    }

    pub async fn is_held(&self, transaction_id: &str, flag: TriggerFlag) -> Result<bool, StoreError> {
        let txn = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(transaction_id.to_string()))?;
        Ok(txn.flags.get(flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Transaction, TransactionKind};
    use crate::store::InMemoryEntityStore;

    async fn guard_with_txn() -> TriggerGuard {
        let store = Arc::new(InMemoryEntityStore::new());
        store
            .insert_transaction(Transaction::new("T1", TransactionKind::Processing))
            .await
            .unwrap();
        TriggerGuard::new(store)
    }

    #[tokio::test]
    async fn acquire_once_until_released() {
        let guard = guard_with_txn().await;
        assert!(guard.try_acquire("T1", TriggerFlag::ApiCall).await.unwrap());
        assert!(!guard.try_acquire("T1", TriggerFlag::ApiCall).await.unwrap());
        assert!(guard.is_held("T1", TriggerFlag::ApiCall).await.unwrap());

        assert!(guard.release("T1", TriggerFlag::ApiCall).await.unwrap());
        assert!(!guard.is_held("T1", TriggerFlag::ApiCall).await.unwrap());
        assert!(guard.try_acquire("T1", TriggerFlag::ApiCall).await.unwrap());
    }

    #[tokio::test]
    async fn flags_are_independent() {
        let guard = guard_with_txn().await;
        assert!(guard.try_acquire("T1", TriggerFlag::Assembly).await.unwrap());
        assert!(guard.try_acquire("T1", TriggerFlag::DocUpload).await.unwrap());
        assert!(!guard.is_held("T1", TriggerFlag::ApiCall).await.unwrap());
    }

    #[tokio::test]
    async fn releasing_a_free_flag_reports_false() {
        let guard = guard_with_txn().await;
        assert!(!guard.release("T1", TriggerFlag::Assembly).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_has_one_winner() {
        let guard = guard_with_txn().await;
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            tasks.push(tokio::spawn(async move {
                guard.try_acquire("T1", TriggerFlag::Assembly).await.unwrap()
            }));
        }
        let mut wins = 0;
        for task in tasks {
            wins += usize::from(task.await.unwrap());
        }
        assert_eq!(wins, 1);
    }
}
