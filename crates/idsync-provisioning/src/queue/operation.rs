//! Provisioning operations and per-account batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use idsync_connector::ids::{BatchId, OperationId};
use idsync_connector::operation::AttributeSet;
use idsync_connector::types::OperationKind;

use crate::error::ProvisioningError;
use crate::identity::AccountRef;

/// One pending change for an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningOperation {
    pub id: OperationId,
    pub account: AccountRef,
    pub kind: OperationKind,
    /// Non-confidential payload snapshot. Null values clear on update.
    pub attributes: AttributeSet,
    /// Confidential values were stored under this operation's id.
    pub has_confidential: bool,
    /// Operations collapsed into this one.
    #[serde(default)]
    pub merged: Vec<OperationId>,
    pub created_at: DateTime<Utc>,
}

impl ProvisioningOperation {
    pub fn new(
        account: AccountRef,
        kind: OperationKind,
        attributes: AttributeSet,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            account,
            kind,
            attributes,
            has_confidential: false,
            merged: Vec::new(),
            created_at,
        }
    }

    /// Whether this operation is `id` or absorbed it.
    #[must_use]
    pub fn covers(&self, id: OperationId) -> bool {
        self.id == id || self.merged.contains(&id)
    }

    fn absorb(&mut self, other: ProvisioningOperation) {
        self.attributes.merge(other.attributes);
        self.has_confidential |= other.has_confidential;
        self.merged.push(other.id);
        self.merged.extend(other.merged);
    }
}

/// Where a batch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Waiting for dispatch or retry.
    Pending,
    /// Claimed by a dispatcher.
    InFlight,
    /// Failed with an error that needs an administrator.
    Parked,
}

impl BatchStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::InFlight => "in_flight",
            BatchStatus::Parked => "parked",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure of a batch, visible to administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub at: DateTime<Utc>,
}

impl BatchError {
    pub fn from_error(error: &ProvisioningError, at: DateTime<Utc>) -> Self {
        Self {
            code: error.error_code().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            at,
        }
    }
}

/// Ordered, collapsed operations for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningBatch {
    pub id: BatchId,
    pub account: AccountRef,
    pub operations: Vec<ProvisioningOperation>,
    /// Operations enqueued while the batch was in flight.
    #[serde(default)]
    pub incoming: Vec<ProvisioningOperation>,
    pub status: BatchStatus,
    /// Ordering reference for retries; never changes once set.
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<BatchError>,
}

impl ProvisioningBatch {
    pub fn new(operation: ProvisioningOperation) -> Self {
        Self {
            id: BatchId::new(),
            account: operation.account.clone(),
            created_at: operation.created_at,
            operations: vec![operation],
            incoming: Vec::new(),
            status: BatchStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// Collapse an operation into the pending list.
    ///
    /// - same kind as the last pending operation: attribute-level merge
    /// - update after a pending create: folded into the create
    /// - delete: supersedes everything pending
    /// - otherwise appended
    pub fn absorb(&mut self, operation: ProvisioningOperation) {
        if operation.kind == OperationKind::Delete {
            let mut delete = operation;
            for superseded in self.operations.drain(..) {
                delete.merged.push(superseded.id);
                delete.merged.extend(superseded.merged);
                delete.has_confidential |= superseded.has_confidential;
            }
            self.operations.push(delete);
            return;
        }

        match self.operations.last_mut() {
            Some(last)
                if last.kind == operation.kind
                    || (last.kind == OperationKind::Create && operation.kind == OperationKind::Update) =>
            {
                last.absorb(operation);
            }
            _ => self.operations.push(operation),
        }
    }

    /// Whether any pending or incoming operation is or absorbed `id`.
    #[must_use]
    pub fn covers(&self, id: OperationId) -> bool {
        self.operations
            .iter()
            .chain(self.incoming.iter())
            .any(|op| op.covers(id))
    }

    /// Ids under which confidential values of this batch were stored.
    #[must_use]
    pub fn confidential_refs(&self) -> Vec<OperationId> {
        let mut refs = Vec::new();
        for op in self.operations.iter().filter(|op| op.has_confidential) {
            refs.push(op.id);
            refs.extend(op.merged.iter().copied());
        }
        refs
    }
}

/// Result of one executed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Executed,
    /// Failed and left pending for retry.
    Failed,
    /// Withheld by an open breaker.
    Blocked,
    Parked,
}

impl OperationOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Executed => "executed",
            OperationOutcome::Failed => "failed",
            OperationOutcome::Blocked => "blocked",
            OperationOutcome::Parked => "parked",
        }
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable history entry for one attempt of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation: ProvisioningOperation,
    pub batch_id: BatchId,
    pub attempt: u32,
    pub outcome: OperationOutcome,
    pub error: Option<BatchError>,
    pub recorded_at: DateTime<Utc>,
}
