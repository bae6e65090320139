//! Provisioning entry points: asynchronous enqueue and synchronous provision.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use idsync_connector::ids::{BatchId, OperationId, SystemId};
use idsync_connector::operation::{AttributeSet, GuardedString};
use idsync_connector::types::OperationKind;

use crate::breaker::BreakerSnapshot;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::identity::AccountRef;

use super::dispatcher::{BatchDispatcher, DispatchOutcome};
use super::operation::{BatchStatus, OperationOutcome, ProvisioningBatch, ProvisioningOperation};
use super::{QueueConfig, QueueContext};

/// Poll interval while another dispatcher holds the caller's batch.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Where an enqueued operation landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub batch_id: BatchId,
    pub operation_id: OperationId,
}

/// Front door of the provisioning queue.
pub struct ProvisioningService {
    ctx: QueueContext,
    dispatcher: Arc<BatchDispatcher>,
    sync_timeout: Duration,
    notify: Option<mpsc::Sender<AccountRef>>,
}

impl ProvisioningService {
    pub fn new(ctx: QueueContext, dispatcher: Arc<BatchDispatcher>, config: &QueueConfig) -> Self {
        Self {
            ctx,
            dispatcher,
            sync_timeout: config.sync_timeout(),
            notify: None,
        }
    }

    /// Wake a worker whenever an account gets new work.
    #[must_use]
    pub fn with_notifier(mut self, notify: mpsc::Sender<AccountRef>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn dispatcher(&self) -> &Arc<BatchDispatcher> {
        &self.dispatcher
    }

    /// Queue a change and return immediately.
    ///
    /// Confidential values are held apart from the queued payload until
    /// dispatch.
    #[instrument(skip(self, attributes, confidential), fields(account = %account, kind = %kind))]
    pub async fn enqueue(
        &self,
        account: AccountRef,
        kind: OperationKind,
        attributes: AttributeSet,
        confidential: BTreeMap<String, GuardedString>,
    ) -> ProvisioningResult<Enqueued> {
        let enqueued = self.store_operation(&account, kind, attributes, confidential).await?;
        self.signal(account);
        Ok(enqueued)
    }

    /// Queue a change and drive it to completion before returning.
    ///
    /// Fails with `ProvisioningBlocked` when the breaker withholds the call,
    /// or `Timeout` when the batch does not finish in time. The operation
    /// stays queued either way.
    #[instrument(skip(self, attributes, confidential), fields(account = %account, kind = %kind))]
    pub async fn provision_sync(
        &self,
        account: AccountRef,
        kind: OperationKind,
        attributes: AttributeSet,
        confidential: BTreeMap<String, GuardedString>,
    ) -> ProvisioningResult<()> {
        let enqueued = self.store_operation(&account, kind, attributes, confidential).await?;

        match tokio::time::timeout(self.sync_timeout, self.drive(&account, enqueued.operation_id)).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(self.sync_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(timeout_ms, "Synchronous provisioning timed out, operation left queued");
                self.signal(account);
                Err(ProvisioningError::Timeout { timeout_ms })
            }
        }
    }

    async fn store_operation(
        &self,
        account: &AccountRef,
        kind: OperationKind,
        attributes: AttributeSet,
        confidential: BTreeMap<String, GuardedString>,
    ) -> ProvisioningResult<Enqueued> {
        let mut operation =
            ProvisioningOperation::new(account.clone(), kind, attributes, self.ctx.clock.now());
        let operation_id = operation.id;
        if !confidential.is_empty() {
            self.ctx.confidential.put(operation_id, confidential).await?;
            operation.has_confidential = true;
        }
        let batch_id = self.ctx.store.enqueue(operation).await?;
        debug!(batch_id = %batch_id, operation_id = %operation_id, "Operation enqueued");
        Ok(Enqueued {
            batch_id,
            operation_id,
        })
    }

    async fn drive(&self, account: &AccountRef, operation_id: OperationId) -> ProvisioningResult<()> {
        loop {
            match self.dispatch_detached(account).await? {
                DispatchOutcome::Executed { .. } | DispatchOutcome::NotClaimed => {
                    if self.is_done(account, operation_id).await? {
                        return Ok(());
                    }
                    if let Some(batch) = self.ctx.store.get_for_account(account).await? {
                        if batch.status == BatchStatus::Parked && batch.covers(operation_id) {
                            return Err(parked_error(account, &batch));
                        }
                    }
                    tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                }
                DispatchOutcome::Blocked { kind, until, .. } => {
                    return Err(ProvisioningError::ProvisioningBlocked {
                        system: account.system.clone(),
                        kind,
                        blocked_until: until,
                    });
                }
                DispatchOutcome::Retrying { error, .. } | DispatchOutcome::Parked { error, .. } => {
                    return Err(error);
                }
            }
        }
    }

    /// Dispatch on a separate task so a caller timeout never abandons a claimed batch.
    async fn dispatch_detached(&self, account: &AccountRef) -> ProvisioningResult<DispatchOutcome> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let account = account.clone();
        tokio::spawn(async move { dispatcher.dispatch(&account).await })
            .await
            .map_err(|e| ProvisioningError::storage(format!("dispatch task failed: {e}")))?
    }

    async fn is_done(&self, account: &AccountRef, operation_id: OperationId) -> ProvisioningResult<bool> {
        let executed = matches!(
            self.ctx.store.latest_record(operation_id).await?,
            Some(record) if record.outcome == OperationOutcome::Executed
        );
        if !executed {
            return Ok(false);
        }
        let still_queued = self
            .ctx
            .store
            .get_for_account(account)
            .await?
            .is_some_and(|batch| batch.covers(operation_id));
        Ok(!still_queued)
    }

    fn signal(&self, account: AccountRef) {
        if let Some(notify) = &self.notify {
            if let Err(e) = notify.try_send(account) {
                // The retry sweep still picks the batch up.
                debug!(error = %e, "Worker not signaled");
            }
        }
    }

    /// Breaker state of one (system, operation kind).
    pub async fn get_breaker_state(
        &self,
        system: &SystemId,
        kind: OperationKind,
    ) -> ProvisioningResult<BreakerSnapshot> {
        self.ctx.breaker.snapshot(system, kind).await
    }

    pub async fn list_parked(&self) -> ProvisioningResult<Vec<ProvisioningBatch>> {
        self.ctx.store.list_parked().await
    }

    /// Return a parked batch to the queue after an administrator fixed the cause.
    #[instrument(skip(self))]
    pub async fn requeue_parked(&self, batch_id: BatchId) -> ProvisioningResult<()> {
        self.ctx.store.requeue_parked(batch_id).await?;
        if let Some(batch) = self.ctx.store.get(batch_id).await? {
            self.signal(batch.account);
        }
        Ok(())
    }
}

fn parked_error(account: &AccountRef, batch: &ProvisioningBatch) -> ProvisioningError {
    let message = batch
        .last_error
        .as_ref()
        .map(|e| format!("{}: {}", e.code, e.message))
        .unwrap_or_else(|| "batch parked".to_string());
    ProvisioningError::Configuration {
        system: account.system.clone(),
        message,
    }
}
