//! Retry sweep.
//!
//! Walks pending batches older than a cutoff in `(created_at, id)` order and
//! dispatches each one. Batches blocked by an open breaker are skipped by
//! the dispatcher without a connector call. At most one sweep runs per
//! process.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use idsync_connector::ids::SweepId;

use crate::clock::{to_chrono, Clock};
use crate::error::{ProvisioningError, ProvisioningResult};

use super::dispatcher::{BatchDispatcher, DispatchOutcome};
use super::store::{BatchStore, SweepCursor};
use super::QueueConfig;

/// Counters of one sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sweep_id: SweepId,
    pub cutoff: DateTime<Utc>,
    /// Eligible batches when the sweep started.
    pub total: u64,
    pub processed: u64,
    pub executed: u64,
    pub retrying: u64,
    pub blocked: u64,
    pub parked: u64,
    /// Claimed elsewhere or already gone.
    pub skipped: u64,
    pub canceled: bool,
}

impl SweepReport {
    fn new(sweep_id: SweepId, cutoff: DateTime<Utc>, total: u64) -> Self {
        Self {
            sweep_id,
            cutoff,
            total,
            processed: 0,
            executed: 0,
            retrying: 0,
            blocked: 0,
            parked: 0,
            skipped: 0,
            canceled: false,
        }
    }

    fn count(&mut self, outcome: &DispatchOutcome) {
        self.processed += 1;
        match outcome {
            DispatchOutcome::NotClaimed => self.skipped += 1,
            DispatchOutcome::Executed { .. } => self.executed += 1,
            DispatchOutcome::Blocked { .. } => self.blocked += 1,
            DispatchOutcome::Retrying { .. } => self.retrying += 1,
            DispatchOutcome::Parked { .. } => self.parked += 1,
        }
    }
}

type ActiveSlot = Arc<Mutex<Option<(SweepId, CancellationToken)>>>;

/// Clears the active slot when the sweep task ends, however it ends.
struct ActiveSweep {
    slot: ActiveSlot,
    id: SweepId,
}

impl Drop for ActiveSweep {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().expect("lock poisoned");
        if slot.as_ref().is_some_and(|(id, _)| *id == self.id) {
            *slot = None;
        }
    }
}

/// A running sweep.
#[derive(Debug)]
pub struct SweepHandle {
    id: SweepId,
    cancel: CancellationToken,
    join: JoinHandle<ProvisioningResult<SweepReport>>,
}

impl SweepHandle {
    pub fn id(&self) -> SweepId {
        self.id
    }

    /// Stop after the item in progress.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> ProvisioningResult<SweepReport> {
        self.join
            .await
            .map_err(|e| ProvisioningError::storage(format!("sweep task failed: {e}")))?
    }
}

/// Re-dispatches pending batches past the grace period.
#[derive(Clone)]
pub struct RetrySweeper {
    dispatcher: Arc<BatchDispatcher>,
    store: Arc<dyn BatchStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    active: ActiveSlot,
}

impl RetrySweeper {
    pub fn new(
        dispatcher: Arc<BatchDispatcher>,
        store: Arc<dyn BatchStore>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            dispatcher,
            store,
            clock,
            config,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Default cutoff: now minus the grace period.
    pub fn default_cutoff(&self) -> DateTime<Utc> {
        self.clock.now() - to_chrono(self.config.retry_grace_period())
    }

    /// The sweep in progress, if any.
    pub fn active(&self) -> Option<SweepId> {
        self.active
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|(id, _)| *id)
    }

    /// Start a sweep in the background.
    ///
    /// Fails with `AlreadyRunning` while another sweep is active.
    pub fn start(&self, cutoff: Option<DateTime<Utc>>) -> ProvisioningResult<SweepHandle> {
        let id = SweepId::new();
        let cancel = CancellationToken::new();
        {
            let mut slot = self.active.lock().expect("lock poisoned");
            if let Some((running, _)) = slot.as_ref() {
                return Err(ProvisioningError::AlreadyRunning {
                    task: "retry sweep",
                    id: running.as_uuid(),
                });
            }
            *slot = Some((id, cancel.clone()));
        }

        let guard = ActiveSweep {
            slot: Arc::clone(&self.active),
            id,
        };
        let cutoff = cutoff.unwrap_or_else(|| self.default_cutoff());
        let sweeper = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let _guard = guard;
            sweeper.sweep(id, cutoff, &token).await
        });

        Ok(SweepHandle { id, cancel, join })
    }

    /// Run a sweep to completion.
    pub async fn run(&self, cutoff: Option<DateTime<Utc>>) -> ProvisioningResult<SweepReport> {
        self.start(cutoff)?.wait().await
    }

    /// Cancel the active sweep if it has this id.
    pub fn cancel(&self, sweep_id: SweepId) -> bool {
        let slot = self.active.lock().expect("lock poisoned");
        match slot.as_ref() {
            Some((id, token)) if *id == sweep_id => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    #[instrument(skip(self, cancel), fields(sweep_id = %id, cutoff = %cutoff))]
    async fn sweep(
        &self,
        id: SweepId,
        cutoff: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<SweepReport> {
        let total = self.store.count_pending_before(cutoff).await?;
        let mut report = SweepReport::new(id, cutoff, total);
        info!(total, "Retry sweep started");

        let mut after: Option<SweepCursor> = None;
        'pages: loop {
            if cancel.is_cancelled() {
                report.canceled = true;
                break;
            }
            let page = self
                .store
                .list_pending_before(cutoff, after, self.config.sweep_page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some((last.created_at, last.id));
            let full_page = page.len() >= self.config.sweep_page_size;

            for batch in page {
                if cancel.is_cancelled() {
                    report.canceled = true;
                    break 'pages;
                }
                match self.dispatcher.dispatch(&batch.account).await {
                    Ok(outcome) => report.count(&outcome),
                    Err(e) => {
                        // One broken batch does not stop the sweep.
                        warn!(batch_id = %batch.id, error = %e, "Sweep dispatch failed");
                        report.processed += 1;
                        report.retrying += 1;
                    }
                }
            }

            if !full_page {
                break;
            }
            debug!(processed = report.processed, "Sweep page done");
        }

        info!(
            processed = report.processed,
            executed = report.executed,
            blocked = report.blocked,
            retrying = report.retrying,
            parked = report.parked,
            canceled = report.canceled,
            "Retry sweep finished"
        );
        Ok(report)
    }
}
