//! Batch dispatch.
//!
//! Claims an account's batch, resolves the connector and capability, gates
//! every operation through the breaker and applies it with a per-call
//! timeout. Outcomes:
//!
//! - success: history archived, batch completed, account lifecycle updated
//! - transient failure: breaker fed, batch released with its `created_at`
//! - breaker open: batch released untouched, no connector call
//! - configuration or data failure: batch parked for an administrator

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use idsync_connector::error::ConnectorError;
use idsync_connector::ids::{BatchId, SystemId};
use idsync_connector::mapping::MappingConfiguration;
use idsync_connector::operation::{AttributeDelta, AttributeSet, GuardedString, Uid, PASSWORD_ATTRIBUTE};
use idsync_connector::resilience::with_timeout;
use idsync_connector::traits::Connector;
use idsync_connector::types::OperationKind;

use chrono::{DateTime, Utc};

use crate::breaker::Admission;
use crate::echo::EchoAspect;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::identity::{Account, AccountRef, AccountState};

use super::operation::{BatchError, OperationOutcome, OperationRecord, ProvisioningBatch, ProvisioningOperation};
use super::{QueueConfig, QueueContext};

/// What happened to a dispatch attempt.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Nothing pending, or another dispatcher holds the account.
    NotClaimed,
    /// Every operation of the batch was applied.
    Executed { batch_id: BatchId, operations: usize },
    /// The breaker is open; the batch stays pending.
    Blocked {
        batch_id: BatchId,
        kind: OperationKind,
        until: DateTime<Utc>,
    },
    /// Transient failure; the batch stays pending for the sweep.
    Retrying {
        batch_id: BatchId,
        error: ProvisioningError,
    },
    /// Needs an administrator.
    Parked {
        batch_id: BatchId,
        error: ProvisioningError,
    },
}

/// Applies batches to connectors.
pub struct BatchDispatcher {
    ctx: QueueContext,
    connector_timeout: Duration,
}

impl BatchDispatcher {
    pub fn new(ctx: QueueContext, config: &QueueConfig) -> Self {
        Self {
            ctx,
            connector_timeout: config.connector_timeout(),
        }
    }

    /// Claim and apply the account's pending batch.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn dispatch(&self, account: &AccountRef) -> ProvisioningResult<DispatchOutcome> {
        let Some(batch) = self.ctx.store.claim(account).await? else {
            debug!("No claimable batch");
            return Ok(DispatchOutcome::NotClaimed);
        };

        let mut next = 0;
        match self.execute(&batch, &mut next).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Never leave a batch claimed after an internal failure, and
                // never hand back operations the target already applied.
                let error = BatchError::from_error(&e, self.ctx.clock.now());
                let remaining = batch.operations.get(next..).unwrap_or_default().to_vec();
                if let Err(release) = self
                    .ctx
                    .store
                    .release(batch.id, remaining, error, false)
                    .await
                {
                    error!(batch_id = %batch.id, error = %release, "Failed to release batch");
                }
                Err(e)
            }
        }
    }

    /// `next` tracks the first operation not yet applied to the target.
    async fn execute(
        &self,
        batch: &ProvisioningBatch,
        next: &mut usize,
    ) -> ProvisioningResult<DispatchOutcome> {
        let system = &batch.account.system;
        let attempt = batch.attempts + 1;

        let connector = match self.ctx.connectors.require(system) {
            Ok(connector) => connector,
            Err(e) => {
                let error = ProvisioningError::from_connector(system, e);
                return self.park(batch, 0, attempt, error).await;
            }
        };
        let confidential = self.ctx.confidential.resolve(&batch.confidential_refs()).await?;
        let mapping = self.ctx.mappings.get(system, &batch.account.object_class);
        let mut account = self.ctx.identities.get_account(batch.account.account_id).await?;

        for (index, op) in batch.operations.iter().enumerate() {
            *next = index;
            let required = op.kind.required_capability();
            if !connector.capabilities().contains(required) {
                let error = ProvisioningError::CapabilityNotSupported {
                    system: system.clone(),
                    capability: required,
                };
                return self.park(batch, index, attempt, error).await;
            }

            let admission = self.ctx.breaker.admit(system, op.kind).await?;
            if let Admission::Blocked { until } = admission {
                let error = ProvisioningError::ProvisioningBlocked {
                    system: system.clone(),
                    kind: op.kind,
                    blocked_until: until,
                };
                self.record(batch, op, attempt, OperationOutcome::Blocked, Some(&error))
                    .await?;
                self.ctx
                    .store
                    .release(
                        batch.id,
                        batch.operations[index..].to_vec(),
                        BatchError::from_error(&error, self.ctx.clock.now()),
                        false,
                    )
                    .await?;
                info!(
                    system = %system,
                    kind = %op.kind,
                    blocked_until = %until,
                    "Operation withheld by open provisioning break"
                );
                return Ok(DispatchOutcome::Blocked {
                    batch_id: batch.id,
                    kind: op.kind,
                    until,
                });
            }

            let mut reached_target = false;
            let applied = self
                .apply(
                    &connector,
                    op,
                    &mut account,
                    &confidential,
                    mapping.as_deref(),
                    &mut reached_target,
                )
                .await;
            if reached_target {
                *next = index + 1;
            }

            match applied {
                Err(error) if reached_target => {
                    // The target took the change; only local bookkeeping failed.
                    self.ctx.breaker.record_success(system, op.kind).await?;
                    return Err(error);
                }
                Ok(()) => {
                    *next = index + 1;
                    self.ctx.breaker.record_success(system, op.kind).await?;
                    self.record(batch, op, attempt, OperationOutcome::Executed, None)
                        .await?;
                }
                Err(error) => {
                    if error.feeds_breaker() {
                        self.ctx.breaker.record_failure(system, op.kind).await?;
                    } else if admission == Admission::Probe {
                        // The target answered, so the probe lease is released.
                        self.ctx.breaker.record_success(system, op.kind).await?;
                    }

                    if error.parks_batch() {
                        return self.park(batch, index, attempt, error).await;
                    }

                    self.record(batch, op, attempt, OperationOutcome::Failed, Some(&error))
                        .await?;
                    self.ctx
                        .store
                        .release(
                            batch.id,
                            batch.operations[index..].to_vec(),
                            BatchError::from_error(&error, self.ctx.clock.now()),
                            true,
                        )
                        .await?;
                    warn!(
                        system = %system,
                        kind = %op.kind,
                        attempt,
                        error = %error,
                        "Provisioning failed, batch left pending for retry"
                    );
                    return Ok(DispatchOutcome::Retrying {
                        batch_id: batch.id,
                        error,
                    });
                }
            }
        }

        self.ctx.store.complete(batch.id).await?;
        self.ctx.confidential.remove(&batch.confidential_refs()).await?;
        debug!(batch_id = %batch.id, operations = batch.operations.len(), "Batch executed");
        Ok(DispatchOutcome::Executed {
            batch_id: batch.id,
            operations: batch.operations.len(),
        })
    }

    async fn park(
        &self,
        batch: &ProvisioningBatch,
        index: usize,
        attempt: u32,
        error: ProvisioningError,
    ) -> ProvisioningResult<DispatchOutcome> {
        if let Some(op) = batch.operations.get(index) {
            self.record(batch, op, attempt, OperationOutcome::Parked, Some(&error))
                .await?;
        }
        self.ctx
            .store
            .park(
                batch.id,
                batch.operations[index..].to_vec(),
                BatchError::from_error(&error, self.ctx.clock.now()),
            )
            .await?;
        error!(
            account = %batch.account,
            batch_id = %batch.id,
            error_code = error.error_code(),
            error = %error,
            "Provisioning batch parked, administrator action required"
        );
        Ok(DispatchOutcome::Parked {
            batch_id: batch.id,
            error,
        })
    }

    async fn record(
        &self,
        batch: &ProvisioningBatch,
        op: &ProvisioningOperation,
        attempt: u32,
        outcome: OperationOutcome,
        error: Option<&ProvisioningError>,
    ) -> ProvisioningResult<()> {
        let now = self.ctx.clock.now();
        self.ctx
            .store
            .record(OperationRecord {
                operation: op.clone(),
                batch_id: batch.id,
                attempt,
                outcome,
                error: error.map(|e| BatchError::from_error(e, now)),
                recorded_at: now,
            })
            .await
    }

    async fn apply(
        &self,
        connector: &Arc<dyn Connector>,
        op: &ProvisioningOperation,
        account: &mut Option<Account>,
        confidential: &BTreeMap<String, GuardedString>,
        mapping: Option<&MappingConfiguration>,
        reached_target: &mut bool,
    ) -> ProvisioningResult<()> {
        let system = &op.account.system;
        let object_class = op.account.object_class.as_str();
        let to_error = |e: ConnectorError| ProvisioningError::from_connector(system, e);

        match op.kind {
            OperationKind::Create => {
                let mut payload: AttributeSet = op
                    .attributes
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (name, value) in confidential {
                    payload.set(name.clone(), value.expose());
                }

                let creator = connector.require_create().map_err(to_error)?;
                let uid = with_timeout(self.connector_timeout, creator.create(object_class, payload))
                    .await
                    .map_err(to_error)?;
                *reached_target = true;
                // The UID is only known now, so an echo of the create can race this.
                self.mark_echoes(system, &uid, &op.attributes, confidential, mapping)
                    .await?;

                let now = self.ctx.clock.now();
                let mut created = account.take().unwrap_or_else(|| {
                    let mut fresh = Account::new(system.clone(), object_class, now);
                    fresh.id = op.account.account_id;
                    fresh
                });
                created.uid = Some(uid.clone());
                created.state = AccountState::Active;
                apply_snapshot(&mut created.attributes, &op.attributes);
                created.updated_at = now;
                self.ctx.identities.save_account(created.clone()).await?;
                *account = Some(created);
                info!(system = %system, uid = %uid, "Created account in target system");
            }
            OperationKind::Update => {
                let Some(uid) = account.as_ref().and_then(|a| a.uid.clone()) else {
                    return Err(ProvisioningError::ValidationFailed {
                        message: format!("account {} has no target UID to update", op.account),
                    });
                };
                let mut delta = AttributeDelta::from_payload(op.attributes.clone());
                for (name, value) in confidential {
                    delta.replace(name.clone(), value.expose());
                }
                if delta.is_empty() {
                    debug!(uid = %uid, "No changes to apply, skipping update");
                    return Ok(());
                }

                self.mark_echoes(system, &uid, &op.attributes, confidential, mapping)
                    .await?;
                let updater = connector.require_update().map_err(to_error)?;
                let new_uid = with_timeout(self.connector_timeout, updater.update(object_class, &uid, delta))
                    .await
                    .map_err(to_error)?;
                *reached_target = true;

                if let Some(updated) = account.as_mut() {
                    updated.uid = Some(new_uid.clone());
                    apply_snapshot(&mut updated.attributes, &op.attributes);
                    updated.updated_at = self.ctx.clock.now();
                    self.ctx.identities.save_account(updated.clone()).await?;
                }
                info!(system = %system, uid = %new_uid, "Updated account in target system");
            }
            OperationKind::Delete => {
                let Some(existing) = account.as_mut() else {
                    debug!(account = %op.account, "Account already removed, nothing to delete");
                    return Ok(());
                };
                if let Some(uid) = existing.uid.clone() {
                    let deleter = connector.require_delete().map_err(to_error)?;
                    match with_timeout(self.connector_timeout, deleter.delete(object_class, &uid)).await {
                        Ok(()) | Err(ConnectorError::ObjectNotFound { .. }) => {}
                        Err(e) => return Err(to_error(e)),
                    }
                    *reached_target = true;
                    info!(system = %system, uid = %uid, "Deleted account from target system");
                }

                if existing.links.is_empty() {
                    self.ctx.identities.delete_account(existing.id).await?;
                    *account = None;
                } else {
                    existing.uid = None;
                    existing.state = AccountState::Disabled;
                    existing.updated_at = self.ctx.clock.now();
                    self.ctx.identities.save_account(existing.clone()).await?;
                }
            }
        }
        Ok(())
    }

    /// Leave markers for every attribute the target echoes back.
    async fn mark_echoes(
        &self,
        system: &SystemId,
        uid: &Uid,
        attributes: &AttributeSet,
        confidential: &BTreeMap<String, GuardedString>,
        mapping: Option<&MappingConfiguration>,
    ) -> ProvisioningResult<()> {
        let Some(mapping) = mapping else {
            return Ok(());
        };
        for (name, value) in attributes.iter() {
            if mapping.echoes(name) && !value.is_null() {
                let aspect = EchoAspect::Attribute(name.clone());
                let shown = value.to_display_string();
                self.ctx.echo.mark(system, uid, &aspect, Some(&shown)).await?;
            }
        }
        for name in confidential.keys() {
            if mapping.echoes(name) {
                let aspect = if name == PASSWORD_ATTRIBUTE {
                    EchoAspect::Password
                } else {
                    EchoAspect::Attribute(name.clone())
                };
                self.ctx.echo.mark(system, uid, &aspect, None).await?;
            }
        }
        Ok(())
    }
}

/// Fold a pushed payload into the account's last known target values.
fn apply_snapshot(snapshot: &mut AttributeSet, pushed: &AttributeSet) {
    for (name, value) in pushed.iter() {
        if value.is_null() {
            snapshot.remove(name);
        } else {
            snapshot.set(name.clone(), value.clone());
        }
    }
}
