//! Process-local registry of reconciliation runs.
//!
//! At most one running executor per configuration. The last finished run of
//! each configuration stays queryable.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use idsync_connector::ids::{RunId, SyncConfigId};

use super::run::{RunHandle, RunState};

#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    running: DashMap<SyncConfigId, RunHandle>,
    last: DashMap<SyncConfigId, RunHandle>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run, or return the one already running.
    pub fn try_register(&self, handle: RunHandle) -> Result<(), RunHandle> {
        match self.running.entry(handle.config_id()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Move a run out of the running set.
    pub fn finish(&self, config_id: SyncConfigId, run_id: RunId) {
        if let Some((_, handle)) = self
            .running
            .remove_if(&config_id, |_, h| h.run_id() == run_id)
        {
            self.last.insert(config_id, handle);
        }
    }

    pub fn running(&self, config_id: SyncConfigId) -> Option<RunHandle> {
        self.running.get(&config_id).map(|h| h.value().clone())
    }

    pub fn find(&self, run_id: RunId) -> Option<RunHandle> {
        self.running
            .iter()
            .chain(self.last.iter())
            .find(|h| h.value().run_id() == run_id)
            .map(|h| h.value().clone())
    }

    pub fn status(&self, run_id: RunId) -> Option<RunState> {
        self.find(run_id).map(|h| h.status())
    }
}
