//! Provisioning error taxonomy.
//!
//! Connector failures are classified once, at the dispatch boundary, into
//! what the queue should do with them: retry, park or report.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use idsync_connector::error::{ConnectorError, ErrorClass};
use idsync_connector::ids::SystemId;
use idsync_connector::types::{Capability, OperationKind};

use crate::cache::CacheError;

/// Error surfaced by the provisioning and synchronization engine.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Transient target failure; retried by the sweep and counted by the breaker.
    #[error("system '{system}' unavailable: {message}")]
    ConnectorUnavailable { system: SystemId, message: String },

    /// The connector lacks the capability the operation needs.
    #[error("system '{system}' does not support the {capability} capability")]
    CapabilityNotSupported {
        system: SystemId,
        capability: Capability,
    },

    /// Connector or mapping setup is wrong (credentials, missing connector).
    #[error("configuration error for system '{system}': {message}")]
    Configuration { system: SystemId, message: String },

    /// The target rejected the payload values.
    #[error("validation failed: {message}")]
    ValidationFailed { message: String },

    /// The payload does not fit the target schema.
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// The breaker is open; the operation was withheld, not attempted.
    #[error("provisioning of {kind} to system '{system}' blocked until {blocked_until}")]
    ProvisioningBlocked {
        system: SystemId,
        kind: OperationKind,
        blocked_until: DateTime<Utc>,
    },

    /// A second instance of a single-instance task was requested.
    #[error("{task} {id} is already running")]
    AlreadyRunning { task: &'static str, id: Uuid },

    /// Cooperative cancellation; not a failure.
    #[error("canceled")]
    Canceled,

    /// A synchronous caller gave up waiting.
    #[error("timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Mapping evaluation failed.
    #[error("transformation failed for attribute '{attribute}': {message}")]
    Transformation { attribute: String, message: String },

    /// Durable storage failed.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// A referenced record does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The shared cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ProvisioningError {
    /// Map a connector failure for `system` into the engine taxonomy.
    pub fn from_connector(system: &SystemId, error: ConnectorError) -> Self {
        match (&error, error.class()) {
            (ConnectorError::CapabilityNotSupported { capability, .. }, _) => {
                ProvisioningError::CapabilityNotSupported {
                    system: system.clone(),
                    capability: *capability,
                }
            }
            (ConnectorError::TransformationFailed { attribute, message }, _) => {
                ProvisioningError::Transformation {
                    attribute: attribute.clone(),
                    message: message.clone(),
                }
            }
            (_, ErrorClass::Transient) => ProvisioningError::ConnectorUnavailable {
                system: system.clone(),
                message: error.to_string(),
            },
            (_, ErrorClass::Configuration) => ProvisioningError::Configuration {
                system: system.clone(),
                message: error.to_string(),
            },
            (e, ErrorClass::Data) if e.is_schema_error() => ProvisioningError::SchemaMismatch {
                message: error.to_string(),
            },
            (_, ErrorClass::Data) => ProvisioningError::ValidationFailed {
                message: error.to_string(),
            },
        }
    }

    /// Whether a later retry can succeed without administrator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisioningError::ConnectorUnavailable { .. }
                | ProvisioningError::ProvisioningBlocked { .. }
                | ProvisioningError::Timeout { .. }
                | ProvisioningError::Storage { .. }
                | ProvisioningError::Cache(_)
        )
    }

    /// Whether the failure feeds the circuit breaker.
    pub fn feeds_breaker(&self) -> bool {
        matches!(self, ProvisioningError::ConnectorUnavailable { .. })
    }

    /// Whether a batch failing with this error is parked for an administrator.
    pub fn parks_batch(&self) -> bool {
        matches!(
            self,
            ProvisioningError::CapabilityNotSupported { .. }
                | ProvisioningError::Configuration { .. }
                | ProvisioningError::ValidationFailed { .. }
                | ProvisioningError::SchemaMismatch { .. }
                | ProvisioningError::Transformation { .. }
        )
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProvisioningError::ConnectorUnavailable { .. } => "CONNECTOR_UNAVAILABLE",
            ProvisioningError::CapabilityNotSupported { .. } => "CAPABILITY_NOT_SUPPORTED",
            ProvisioningError::Configuration { .. } => "CONFIGURATION",
            ProvisioningError::ValidationFailed { .. } => "VALIDATION_FAILED",
            ProvisioningError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            ProvisioningError::ProvisioningBlocked { .. } => "PROVISIONING_BLOCKED",
            ProvisioningError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            ProvisioningError::Canceled => "CANCELED",
            ProvisioningError::Timeout { .. } => "TIMEOUT",
            ProvisioningError::Transformation { .. } => "TRANSFORMATION_FAILED",
            ProvisioningError::Storage { .. } => "STORAGE",
            ProvisioningError::NotFound { .. } => "NOT_FOUND",
            ProvisioningError::Cache(_) => "CACHE",
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        ProvisioningError::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ProvisioningError::NotFound { what: what.into() }
    }
}

/// Result type for provisioning operations.
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn ldap1() -> SystemId {
        SystemId::new("ldap1").unwrap()
    }

    #[test]
    fn test_transient_connector_errors_become_unavailable() {
        let err = ProvisioningError::from_connector(&ldap1(), ConnectorError::unavailable("down"));
        assert!(matches!(err, ProvisioningError::ConnectorUnavailable { .. }));
        assert!(err.is_retryable());
        assert!(err.feeds_breaker());
        assert!(!err.parks_batch());
    }

    #[test]
    fn test_capability_errors_park() {
        let err = ProvisioningError::from_connector(
            &ldap1(),
            ConnectorError::capability_not_supported(Capability::Update, "csv"),
        );
        assert!(matches!(
            err,
            ProvisioningError::CapabilityNotSupported {
                capability: Capability::Update,
                ..
            }
        ));
        assert!(err.parks_batch());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_data_errors_split_schema_and_validation() {
        let schema = ProvisioningError::from_connector(
            &ldap1(),
            ConnectorError::ObjectClassNotFound {
                object_class: "group".to_string(),
            },
        );
        assert_eq!(schema.error_code(), "SCHEMA_MISMATCH");

        let data =
            ProvisioningError::from_connector(&ldap1(), ConnectorError::invalid_data("bad mail"));
        assert_eq!(data.error_code(), "VALIDATION_FAILED");
        assert!(data.parks_batch());
    }

    #[test]
    fn test_blocked_is_retryable_but_not_counted() {
        let err = ProvisioningError::ProvisioningBlocked {
            system: ldap1(),
            kind: OperationKind::Update,
            blocked_until: Utc::now(),
        };
        assert!(err.is_retryable());
        assert!(!err.feeds_breaker());
        assert!(!err.parks_batch());
    }
}
