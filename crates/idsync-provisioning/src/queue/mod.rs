//! Provisioning queue and batch executor.
//!
//! Identity-side changes become [`ProvisioningOperation`]s collapsed into one
//! [`ProvisioningBatch`] per account. The [`BatchDispatcher`] applies a batch
//! through the connector behind the breaker gate; failures leave it pending
//! for the [`RetrySweeper`] with its original ordering timestamp.

mod confidential;
mod dispatcher;
mod operation;
mod service;
mod store;
mod sweep;

pub use confidential::{ConfidentialStore, InMemoryConfidentialStore};
pub use dispatcher::{BatchDispatcher, DispatchOutcome};
pub use operation::{
    BatchError, BatchStatus, OperationOutcome, OperationRecord, ProvisioningBatch,
    ProvisioningOperation,
};
pub use service::{Enqueued, ProvisioningService};
pub use store::{BatchStore, InMemoryBatchStore, SweepCursor};
pub use sweep::{RetrySweeper, SweepHandle, SweepReport};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use idsync_connector::registry::ConnectorRegistry;

use crate::breaker::ProvisioningBreaker;
use crate::clock::Clock;
use crate::echo::EchoSuppressor;
use crate::identity::IdentityStore;
use crate::mapping::MappingRepository;

/// Queue timing and paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Deadline for a single connector call.
    #[serde(default = "default_connector_timeout_ms")]
    pub connector_timeout_ms: u64,

    /// How long a synchronous provisioning caller waits.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Batches younger than this are left to the worker, not the sweep.
    #[serde(default = "default_retry_grace_period_secs")]
    pub retry_grace_period_secs: u64,

    #[serde(default = "default_sweep_page_size")]
    pub sweep_page_size: usize,
}

fn default_connector_timeout_ms() -> u64 {
    30_000
}

fn default_sync_timeout_ms() -> u64 {
    60_000
}

fn default_retry_grace_period_secs() -> u64 {
    300
}

fn default_sweep_page_size() -> usize {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            connector_timeout_ms: default_connector_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            retry_grace_period_secs: default_retry_grace_period_secs(),
            sweep_page_size: default_sweep_page_size(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn connector_timeout(&self) -> Duration {
        Duration::from_millis(self.connector_timeout_ms)
    }

    #[must_use]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    #[must_use]
    pub fn retry_grace_period(&self) -> Duration {
        Duration::from_secs(self.retry_grace_period_secs)
    }
}

/// Collaborators shared by the queue components.
#[derive(Clone)]
pub struct QueueContext {
    pub store: Arc<dyn BatchStore>,
    pub confidential: Arc<dyn ConfidentialStore>,
    pub connectors: Arc<ConnectorRegistry>,
    pub identities: Arc<dyn IdentityStore>,
    pub mappings: Arc<MappingRepository>,
    pub breaker: ProvisioningBreaker,
    pub echo: EchoSuppressor,
    pub clock: Arc<dyn Clock>,
}
