//! Sync error types.

use thiserror::Error;

use idsync_connector::ids::{SyncConfigId, SystemId};

use crate::error::ProvisioningError;

use super::run::RunHandle;

/// Errors that can occur when starting or feeding synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A run for this configuration is in progress; its handle is returned.
    #[error("sync configuration {} already running as run {}", .existing.config_id(), .existing.run_id())]
    AlreadyRunning { existing: RunHandle },

    #[error("sync configuration {id} not found")]
    ConfigNotFound { id: SyncConfigId },

    #[error("no sync configuration for {system}/{object_class}")]
    NoConfiguration {
        system: SystemId,
        object_class: String,
    },

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
}

impl SyncError {
    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            SyncError::ConfigNotFound { .. } | SyncError::NoConfiguration { .. } => "NOT_FOUND",
            SyncError::Provisioning(e) => e.error_code(),
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
