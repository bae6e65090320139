//! Run state tracking for reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use idsync_connector::ids::{RunId, SyncConfigId};

/// Status of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    /// Stopped on request; not a failure.
    Canceled,
    Failed,
}

impl RunStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Canceled => "canceled",
            RunStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Canceled | RunStatus::Failed
        )
    }

    #[must_use]
    pub fn can_cancel(&self) -> bool {
        matches!(self, RunStatus::Idle | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Statistics for a reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Remote objects known so far (grows as pages arrive when the target
    /// reports no total).
    pub total: u64,
    /// Remote objects processed so far.
    pub processed: u64,
    /// Unlinked accounts created for remote-only objects.
    pub created: u64,
    /// Accounts linked to a correlated identity.
    pub linked: u64,
    /// Accounts whose changes were applied inbound or restored outbound.
    pub updated: u64,
    pub echoes_suppressed: u64,
    pub flagged: u64,
    pub ignored: u64,
    /// Accounts handled by the missing strategy.
    pub missing: u64,
    /// Accounts queued for re-creation on the target.
    pub restored: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl RunStatistics {
    /// Calculate progress percentage.
    #[must_use]
    pub fn progress_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.processed as f64 / self.total as f64) * 100.0
        }
    }
}

/// Observable state of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    pub run_id: RunId,
    pub config_id: SyncConfigId,
    pub status: RunStatus,
    pub statistics: RunStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub(crate) fn running(run_id: RunId, config_id: SyncConfigId, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            config_id,
            status: RunStatus::Running,
            statistics: RunStatistics::default(),
            error: None,
            started_at,
            finished_at: None,
        }
    }
}

/// Handle to a run: status, cancellation and completion.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    config_id: SyncConfigId,
    state: watch::Receiver<RunState>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub(crate) fn new(
        state: watch::Receiver<RunState>,
        cancel: CancellationToken,
    ) -> Self {
        let (run_id, config_id) = {
            let current = state.borrow();
            (current.run_id, current.config_id)
        };
        Self {
            run_id,
            config_id,
            state,
            cancel,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn config_id(&self) -> SyncConfigId {
        self.config_id
    }

    /// Current state snapshot.
    pub fn status(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// Request cooperative cancellation; takes effect at the next item.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> RunState {
        let mut state = self.state.clone();
        // A closed channel still holds the final value.
        let done = state
            .wait_for(|s| s.status.is_terminal())
            .await
            .map(|r| r.clone());
        match done {
            Ok(done) => done,
            Err(_) => state.borrow().clone(),
        }
    }
}
