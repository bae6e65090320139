//! Provisioning Worker
//!
//! Background worker that dispatches batches as accounts are signaled and
//! periodically starts the retry sweep. Stops gracefully on cancellation:
//! the active sweep is cancelled and in-flight dispatches are awaited.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::error::ProvisioningError;
use crate::identity::AccountRef;
use crate::queue::{BatchDispatcher, DispatchOutcome, RetrySweeper, SweepHandle};

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent dispatches.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How often to start a retry sweep (in seconds).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Pending account signals before enqueue stops signaling.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            sweep_interval_secs: default_sweep_interval_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Provisioning worker that drains signaled accounts.
pub struct ProvisioningWorker {
    dispatcher: Arc<BatchDispatcher>,
    sweeper: RetrySweeper,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl ProvisioningWorker {
    /// Create a new worker.
    pub fn new(dispatcher: Arc<BatchDispatcher>, sweeper: RetrySweeper, config: WorkerConfig) -> Self {
        Self {
            dispatcher,
            sweeper,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// Check if shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run on a background task.
    pub fn spawn(self, signals: mpsc::Receiver<AccountRef>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(signals).await })
    }

    /// Start the worker.
    #[instrument(skip(self, signals))]
    pub async fn run(&self, mut signals: mpsc::Receiver<AccountRef>) {
        info!(
            concurrency = self.config.concurrency,
            sweep_interval_secs = self.config.sweep_interval_secs,
            "Starting provisioning worker"
        );

        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut sweep_interval = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is not a sweep.
        sweep_interval.tick().await;
        let mut sweep: Option<SweepHandle> = None;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Worker shutdown requested, stopping signal loop");
                    break;
                }
                signal = signals.recv() => {
                    let Some(account) = signal else {
                        info!("Signal channel closed, stopping worker");
                        break;
                    };
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break;
                    };
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move {
                        let _permit = permit; // Hold permit until task completes
                        drain_account(dispatcher, account).await;
                    });
                }
                _ = sweep_interval.tick() => {
                    if let Some(handle) = self.start_sweep() {
                        sweep = Some(handle);
                    }
                }
            }
        }

        self.stop_sweep(sweep).await;

        // Wait for in-flight dispatches to complete
        info!("Waiting for in-flight dispatches to complete...");
        let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;
        info!("Worker stopped");
    }

    fn start_sweep(&self) -> Option<SweepHandle> {
        match self.sweeper.start(None) {
            Ok(handle) => {
                debug!(sweep_id = %handle.id(), "Periodic retry sweep started");
                Some(handle)
            }
            Err(ProvisioningError::AlreadyRunning { id, .. }) => {
                debug!(sweep_id = %id, "Retry sweep still running, skipping tick");
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to start retry sweep");
                None
            }
        }
    }

    /// Cancel the active sweep, whoever started it, and wait for our own.
    async fn stop_sweep(&self, own: Option<SweepHandle>) {
        if let Some(id) = self.sweeper.active() {
            if self.sweeper.cancel(id) {
                info!(sweep_id = %id, "Retry sweep cancelled for shutdown");
            }
        }
        if let Some(handle) = own {
            match handle.wait().await {
                Ok(report) => debug!(processed = report.processed, "Periodic retry sweep stopped"),
                Err(e) => error!(error = %e, "Periodic retry sweep failed"),
            }
        }
    }
}

/// Dispatch an account until nothing is left to do right now.
#[instrument(skip(dispatcher), fields(account = %account))]
async fn drain_account(dispatcher: Arc<BatchDispatcher>, account: AccountRef) {
    loop {
        match dispatcher.dispatch(&account).await {
            // Operations that arrived mid-flight form a new batch.
            Ok(DispatchOutcome::Executed { .. }) => continue,
            Ok(_) => break,
            Err(e) => {
                error!(error = %e, "Dispatch failed");
                break;
            }
        }
    }
}
