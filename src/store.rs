//! Durable entity store seam.
//!
//! All status and flag changes go through compare-and-set operations so that
//! concurrent handlers in separate processes cannot both apply the same step.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{Batch, Link, OutboundResult, Transaction, TriggerFlag, VerificationState};
use crate::state_machine::{BatchStatus, TransactionStatus};

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_batch(&self, batch: Batch) -> Result<(), StoreError>;

    async fn batch(&self, batch_id: &str) -> Result<Option<Batch>, StoreError>;

    /// Set the batch status to `new` only if it currently is `expected`.
    async fn compare_and_set_batch_status(
        &self,
        batch_id: &str,
        expected: BatchStatus,
        new: BatchStatus,
    ) -> Result<bool, StoreError>;

    /// Mark a batch failed unless it already is terminal. Returns the status it
    /// was in when the failure was applied.
    async fn fail_batch(&self, batch_id: &str) -> Result<Option<BatchStatus>, StoreError>;

    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), StoreError>;

    async fn transaction(&self, transaction_id: &str) -> Result<Option<Transaction>, StoreError>;

    async fn compare_and_set_transaction_status(
        &self,
        transaction_id: &str,
        expected: TransactionStatus,
        new: TransactionStatus,
    ) -> Result<bool, StoreError>;

    /// Mark a transaction failed unless it already is terminal.
    async fn fail_transaction(&self, transaction_id: &str) -> Result<Option<TransactionStatus>, StoreError>;

    /// Atomically flip a trigger flag from `current` to `new`.
    async fn compare_and_set_flag(
        &self,
        transaction_id: &str,
        flag: TriggerFlag,
        current: bool,
        new: bool,
    ) -> Result<bool, StoreError>;

    async fn set_assembled_results(&self, transaction_id: &str, results: Value) -> Result<(), StoreError>;

    async fn push_outbound_result(&self, transaction_id: &str, result: OutboundResult) -> Result<(), StoreError>;

    async fn set_verification(&self, transaction_id: &str, state: VerificationState) -> Result<(), StoreError>;

    async fn insert_link(&self, link: Link) -> Result<(), StoreError>;

    async fn links(&self, transaction_id: &str) -> Result<Vec<Link>, StoreError>;

    async fn mark_classified(&self, batch_id: &str) -> Result<(), StoreError>;
}

/// Process-local durable store. CAS operations hold the map shard lock for the
/// whole read-compare-write so they are atomic across tasks.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    batches: DashMap<String, Batch>,
    transactions: DashMap<String, Transaction>,
    links: RwLock<Vec<Link>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_transaction<T>(
        &self,
        transaction_id: &str,
        f: impl FnOnce(&mut Transaction) -> T,
    ) -> Result<T, StoreError> {
        let mut entry = self
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| StoreError::NotFound(transaction_id.to_string()))?;
        let out = f(entry.value_mut());
        entry.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn insert_batch(&self, batch: Batch) -> Result<(), StoreError> {
        match self.batches.entry(batch.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(batch.id)),
            Entry::Vacant(slot) => {
                slot.insert(batch);
                Ok(())
            }
        }
    }

    async fn batch(&self, batch_id: &str) -> Result<Option<Batch>, StoreError> {
        Ok(self.batches.get(batch_id).map(|b| b.clone()))
    }

    async fn compare_and_set_batch_status(
        &self,
        batch_id: &str,
        expected: BatchStatus,
        new: BatchStatus,
    ) -> Result<bool, StoreError> {
        let mut entry = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;
        if entry.status != expected {
            return Ok(false);
        }
        entry.status = new;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_batch(&self, batch_id: &str) -> Result<Option<BatchStatus>, StoreError> {
        let mut entry = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;
        if entry.status.is_terminal() {
            return Ok(None);
        }
        let previous = entry.status;
        entry.status = BatchStatus::Failed;
        entry.updated_at = Utc::now();
        Ok(Some(previous))
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), StoreError> {
        match self.transactions.entry(transaction.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(transaction.id)),
            Entry::Vacant(slot) => {
                slot.insert(transaction);
                Ok(())
            }
        }
    }

    async fn transaction(&self, transaction_id: &str) -> Result<Option<Transaction>, StoreError> {
        Ok(self.transactions.get(transaction_id).map(|t| t.clone()))
    }

    async fn compare_and_set_transaction_status(
        &self,
        transaction_id: &str,
        expected: TransactionStatus,
        new: TransactionStatus,
    ) -> Result<bool, StoreError> {
        self.with_transaction(transaction_id, |txn| {
            if txn.status != expected {
                return false;
            }
            txn.status = new;
            true
        })
    }

    async fn fail_transaction(&self, transaction_id: &str) -> Result<Option<TransactionStatus>, StoreError> {
        self.with_transaction(transaction_id, |txn| {
            if txn.status.is_terminal() {
                return None;
            }
            let previous = txn.status;
            txn.status = TransactionStatus::Failed;
            Some(previous)
        })
    }

    async fn compare_and_set_flag(
        &self,
        transaction_id: &str,
        flag: TriggerFlag,
        current: bool,
        new: bool,
    ) -> Result<bool, StoreError> {
        self.with_transaction(transaction_id, |txn| {
            if txn.flags.get(flag) != current {
                return false;
            }
            txn.flags.set(flag, new);
            true
        })
    }

    async fn set_assembled_results(&self, transaction_id: &str, results: Value) -> Result<(), StoreError> {
        self.with_transaction(transaction_id, |txn| txn.assembled_results = results)
    }

    async fn push_outbound_result(&self, transaction_id: &str, result: OutboundResult) -> Result<(), StoreError> {
        self.with_transaction(transaction_id, |txn| txn.outbound_results.push(result))
    }

    async fn set_verification(&self, transaction_id: &str, state: VerificationState) -> Result<(), StoreError> {
        self.with_transaction(transaction_id, |txn| txn.verification = state)
    }

    async fn insert_link(&self, link: Link) -> Result<(), StoreError> {
        let mut links = self.links.write();
        if links.iter().any(|l| l.batch_id == link.batch_id) {
            return Err(StoreError::Duplicate(link.batch_id));
        }
        links.push(link);
        Ok(())
    }

    async fn links(&self, transaction_id: &str) -> Result<Vec<Link>, StoreError> {
        Ok(self
            .links
            .read()
            .iter()
            .filter(|l| l.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn mark_classified(&self, batch_id: &str) -> Result<(), StoreError> {
        let mut links = self.links.write();
        match links.iter_mut().find(|l| l.batch_id == batch_id) {
            Some(link) => {
                link.classified = true;
                Ok(())
            }
            None => Err(StoreError::NotFound(batch_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchMode, DocumentFormat, TransactionKind};
    use std::sync::Arc;

    fn batch(id: &str) -> Batch {
        Batch::new(id, BatchMode::Processing, DocumentFormat::Document)
    }

    #[tokio::test]
    async fn batch_cas_only_applies_from_expected_status() {
        let store = InMemoryEntityStore::new();
        store.insert_batch(batch("B1")).await.unwrap();

        assert!(
            store
                .compare_and_set_batch_status("B1", BatchStatus::Uploading, BatchStatus::Queued)
                .await
                .unwrap()
        );
        assert!(
            !store
                .compare_and_set_batch_status("B1", BatchStatus::Uploading, BatchStatus::Queued)
                .await
                .unwrap()
        );
        assert_eq!(store.batch("B1").await.unwrap().unwrap().status, BatchStatus::Queued);
    }

    #[tokio::test]
    async fn duplicate_inserts_are_rejected() {
        let store = InMemoryEntityStore::new();
        store.insert_batch(batch("B1")).await.unwrap();
        assert!(matches!(
            store.insert_batch(batch("B1")).await,
            Err(StoreError::Duplicate(_))
        ));

        store
            .insert_link(Link::uploaded("T1", "B1", BatchMode::Processing))
            .await
            .unwrap();
        assert!(
            store
                .insert_link(Link::uploaded("T2", "B1", BatchMode::Processing))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn fail_batch_is_idempotent() {
        let store = InMemoryEntityStore::new();
        store.insert_batch(batch("B1")).await.unwrap();
        assert_eq!(store.fail_batch("B1").await.unwrap(), Some(BatchStatus::Uploading));
        assert_eq!(store.fail_batch("B1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_transaction_is_not_found() {
        let store = InMemoryEntityStore::new();
        let err = store
            .compare_and_set_flag("nope", TriggerFlag::Assembly, false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flag_cas_has_single_winner() {
        let store = Arc::new(InMemoryEntityStore::new());
        store
            .insert_transaction(Transaction::new("T1", TransactionKind::Processing))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_set_flag("T1", TriggerFlag::Assembly, false, true)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn links_are_scoped_to_transaction() {
        let store = InMemoryEntityStore::new();
        store
            .insert_link(Link::uploaded("T1", "B1", BatchMode::Processing))
            .await
            .unwrap();
        store
            .insert_link(Link::uploaded("T2", "B2", BatchMode::Processing))
            .await
            .unwrap();
        store.mark_classified("B1").await.unwrap();

        let links = store.links("T1").await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].classified);
        assert!(!store.links("T2").await.unwrap()[0].classified);
    }
}
