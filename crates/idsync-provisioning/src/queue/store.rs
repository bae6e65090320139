//! Durable batch storage contract.
//!
//! One open batch per account. The store is the serialization point: a batch
//! is dispatched only after `claim` flips it to in-flight, and operations
//! arriving meanwhile wait in `incoming` instead of joining the in-flight
//! payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use idsync_connector::ids::{BatchId, OperationId};

use crate::error::{ProvisioningError, ProvisioningResult};
use crate::identity::AccountRef;

use super::operation::{
    BatchError, BatchStatus, OperationRecord, ProvisioningBatch, ProvisioningOperation,
};

/// Keyset position in the retry scan.
pub type SweepCursor = (DateTime<Utc>, BatchId);

/// Storage for pending batches and operation history.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Add an operation to the account's batch, creating one when needed.
    async fn enqueue(&self, operation: ProvisioningOperation) -> ProvisioningResult<BatchId>;

    /// Claim the account's pending batch for dispatch.
    ///
    /// Returns `None` when there is nothing pending or another dispatcher
    /// holds the batch.
    async fn claim(&self, account: &AccountRef) -> ProvisioningResult<Option<ProvisioningBatch>>;

    /// Finish an in-flight batch successfully.
    ///
    /// Operations that arrived while in flight become a fresh pending batch.
    async fn complete(&self, batch_id: BatchId) -> ProvisioningResult<()>;

    /// Return an in-flight batch to pending with the operations still to do.
    ///
    /// `created_at` is kept. `attempted` counts the dispatch as an attempt.
    async fn release(
        &self,
        batch_id: BatchId,
        remaining: Vec<ProvisioningOperation>,
        error: BatchError,
        attempted: bool,
    ) -> ProvisioningResult<()>;

    /// Park an in-flight batch for an administrator.
    async fn park(
        &self,
        batch_id: BatchId,
        remaining: Vec<ProvisioningOperation>,
        error: BatchError,
    ) -> ProvisioningResult<()>;

    /// Return a parked batch to pending after intervention.
    async fn requeue_parked(&self, batch_id: BatchId) -> ProvisioningResult<()>;

    async fn get(&self, batch_id: BatchId) -> ProvisioningResult<Option<ProvisioningBatch>>;

    async fn get_for_account(
        &self,
        account: &AccountRef,
    ) -> ProvisioningResult<Option<ProvisioningBatch>>;

    /// Pending batches created before `cutoff`, ordered by (created_at, id),
    /// strictly after `after`.
    async fn list_pending_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<SweepCursor>,
        limit: usize,
    ) -> ProvisioningResult<Vec<ProvisioningBatch>>;

    async fn count_pending_before(&self, cutoff: DateTime<Utc>) -> ProvisioningResult<u64>;

    async fn list_parked(&self) -> ProvisioningResult<Vec<ProvisioningBatch>>;

    /// Archive an attempt.
    async fn record(&self, record: OperationRecord) -> ProvisioningResult<()>;

    /// History of an account, oldest first.
    async fn history(&self, account: &AccountRef) -> ProvisioningResult<Vec<OperationRecord>>;

    /// Latest record of an operation, including operations collapsed into another.
    async fn latest_record(&self, operation_id: OperationId)
        -> ProvisioningResult<Option<OperationRecord>>;
}

#[derive(Debug, Default)]
struct Inner {
    batches: HashMap<BatchId, ProvisioningBatch>,
    by_account: HashMap<AccountRef, BatchId>,
    history: Vec<OperationRecord>,
}

impl Inner {
    fn in_flight(&mut self, batch_id: BatchId) -> ProvisioningResult<&mut ProvisioningBatch> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| ProvisioningError::not_found(format!("batch {batch_id}")))?;
        if batch.status != BatchStatus::InFlight {
            return Err(ProvisioningError::storage(format!(
                "batch {batch_id} is {} not in flight",
                batch.status
            )));
        }
        Ok(batch)
    }

    fn remove(&mut self, batch_id: BatchId) {
        if let Some(batch) = self.batches.remove(&batch_id) {
            self.by_account.remove(&batch.account);
        }
    }
}

/// In-memory implementation of `BatchStore` for testing.
#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    inner: RwLock<Inner>,
}

impl InMemoryBatchStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of open batches (for testing).
    pub async fn len(&self) -> usize {
        self.inner.read().await.batches.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get all history records (for testing).
    pub async fn all_records(&self) -> Vec<OperationRecord> {
        self.inner.read().await.history.clone()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn enqueue(&self, operation: ProvisioningOperation) -> ProvisioningResult<BatchId> {
        let mut inner = self.inner.write().await;
        if let Some(batch_id) = inner.by_account.get(&operation.account).copied() {
            if let Some(batch) = inner.batches.get_mut(&batch_id) {
                match batch.status {
                    BatchStatus::InFlight => batch.incoming.push(operation),
                    BatchStatus::Pending | BatchStatus::Parked => batch.absorb(operation),
                }
                return Ok(batch_id);
            }
        }

        let batch = ProvisioningBatch::new(operation);
        let batch_id = batch.id;
        inner.by_account.insert(batch.account.clone(), batch_id);
        inner.batches.insert(batch_id, batch);
        Ok(batch_id)
    }

    async fn claim(&self, account: &AccountRef) -> ProvisioningResult<Option<ProvisioningBatch>> {
        let mut inner = self.inner.write().await;
        let Some(batch_id) = inner.by_account.get(account).copied() else {
            return Ok(None);
        };
        match inner.batches.get_mut(&batch_id) {
            Some(batch) if batch.status == BatchStatus::Pending => {
                batch.status = BatchStatus::InFlight;
                Ok(Some(batch.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, batch_id: BatchId) -> ProvisioningResult<()> {
        let mut inner = self.inner.write().await;
        let incoming = std::mem::take(&mut inner.in_flight(batch_id)?.incoming);
        let mut incoming = incoming.into_iter();
        match incoming.next() {
            None => inner.remove(batch_id),
            Some(first) => {
                let mut next = ProvisioningBatch::new(first);
                for op in incoming {
                    next.absorb(op);
                }
                next.id = batch_id;
                inner.batches.insert(batch_id, next);
            }
        }
        Ok(())
    }

    async fn release(
        &self,
        batch_id: BatchId,
        remaining: Vec<ProvisioningOperation>,
        error: BatchError,
        attempted: bool,
    ) -> ProvisioningResult<()> {
        let mut inner = self.inner.write().await;
        let batch = inner.in_flight(batch_id)?;
        batch.operations = remaining;
        for op in std::mem::take(&mut batch.incoming) {
            batch.absorb(op);
        }
        if attempted {
            batch.attempts += 1;
        }
        batch.last_error = Some(error);
        batch.status = BatchStatus::Pending;
        Ok(())
    }

    async fn park(
        &self,
        batch_id: BatchId,
        remaining: Vec<ProvisioningOperation>,
        error: BatchError,
    ) -> ProvisioningResult<()> {
        let mut inner = self.inner.write().await;
        let batch = inner.in_flight(batch_id)?;
        batch.operations = remaining;
        for op in std::mem::take(&mut batch.incoming) {
            batch.absorb(op);
        }
        batch.attempts += 1;
        batch.last_error = Some(error);
        batch.status = BatchStatus::Parked;
        Ok(())
    }

    async fn requeue_parked(&self, batch_id: BatchId) -> ProvisioningResult<()> {
        let mut inner = self.inner.write().await;
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| ProvisioningError::not_found(format!("batch {batch_id}")))?;
        if batch.status != BatchStatus::Parked {
            return Err(ProvisioningError::storage(format!(
                "batch {batch_id} is {} not parked",
                batch.status
            )));
        }
        batch.status = BatchStatus::Pending;
        Ok(())
    }

    async fn get(&self, batch_id: BatchId) -> ProvisioningResult<Option<ProvisioningBatch>> {
        Ok(self
            .inner
            .read()
            .await
            .batches
            .get(&batch_id)
            .cloned())
    }

    async fn get_for_account(
        &self,
        account: &AccountRef,
    ) -> ProvisioningResult<Option<ProvisioningBatch>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_account
            .get(account)
            .and_then(|id| inner.batches.get(id))
            .cloned())
    }

    async fn list_pending_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<SweepCursor>,
        limit: usize,
    ) -> ProvisioningResult<Vec<ProvisioningBatch>> {
        let inner = self.inner.read().await;
        let mut batches: Vec<&ProvisioningBatch> = inner
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Pending && b.created_at < cutoff)
            .filter(|b| after.map_or(true, |cursor| (b.created_at, b.id) > cursor))
            .collect();
        batches.sort_by_key(|b| (b.created_at, b.id));
        Ok(batches.into_iter().take(limit).cloned().collect())
    }

    async fn count_pending_before(&self, cutoff: DateTime<Utc>) -> ProvisioningResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Pending && b.created_at < cutoff)
            .count() as u64)
    }

    async fn list_parked(&self) -> ProvisioningResult<Vec<ProvisioningBatch>> {
        let inner = self.inner.read().await;
        let mut parked: Vec<ProvisioningBatch> = inner
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Parked)
            .cloned()
            .collect();
        parked.sort_by_key(|b| (b.created_at, b.id));
        Ok(parked)
    }

    async fn record(&self, record: OperationRecord) -> ProvisioningResult<()> {
        self.inner
            .write()
            .await
            .history
            .push(record);
        Ok(())
    }

    async fn history(&self, account: &AccountRef) -> ProvisioningResult<Vec<OperationRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .history
            .iter()
            .filter(|r| &r.operation.account == account)
            .cloned()
            .collect())
    }

    async fn latest_record(
        &self,
        operation_id: OperationId,
    ) -> ProvisioningResult<Option<OperationRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .history
            .iter()
            .rev()
            .find(|r| r.operation.covers(operation_id))
            .cloned())
    }
}
