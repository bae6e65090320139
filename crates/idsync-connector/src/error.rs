//! Connector error types
//!
//! Error definitions with a transient / configuration / data classification
//! used by the provisioning engine to decide between retry and parking.

use thiserror::Error;

use crate::ids::SystemId;
use crate::types::Capability;

/// How the engine should treat a connector failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The target may recover on its own; retry later and feed the breaker.
    Transient,
    /// Administrator intervention on connector or mapping setup is needed.
    Configuration,
    /// The payload itself is unacceptable to the target.
    Data,
}

/// Error that can occur during connector operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    // Connection errors (transient)
    /// Failed to establish connection to target system.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connector call did not finish in time.
    #[error("connection timeout after {timeout_ms} ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// Target system is temporarily unavailable.
    #[error("target system unavailable: {message}")]
    TargetUnavailable { message: String },

    /// Network error during communication.
    #[error("network error: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Configuration errors
    /// Invalid credentials provided.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    /// Connector configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// The connector does not implement a capability the engine needs.
    #[error("connector '{connector}' does not support the {capability} capability")]
    CapabilityNotSupported {
        capability: Capability,
        connector: String,
    },

    /// No connector is registered for the system.
    #[error("no connector registered for system '{system}'")]
    ConnectorNotFound { system: SystemId },

    // Schema errors
    /// Object class not found in schema.
    #[error("object class '{object_class}' not found in schema")]
    ObjectClassNotFound { object_class: String },

    /// Attribute not found in schema.
    #[error("attribute '{attribute}' not found in object class '{object_class}'")]
    AttributeNotFound {
        attribute: String,
        object_class: String,
    },

    /// Payload does not fit the target schema.
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// Transformation failed during attribute mapping.
    #[error("transformation failed for attribute '{attribute}': {message}")]
    TransformationFailed { attribute: String, message: String },

    // Data errors
    /// Object already exists in target system (create conflict).
    #[error("object already exists: {identifier}")]
    ObjectAlreadyExists { identifier: String },

    /// Object not found in target system (update/delete target missing).
    #[error("object not found: {identifier}")]
    ObjectNotFound { identifier: String },

    /// Constraint violation in target system.
    #[error("constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// Invalid data format.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    // Internal errors
    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ConnectorError {
    /// Check if this error is transient and the operation should be retried.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Classify the error for retry and parking decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            ConnectorError::ConnectionFailed { .. }
            | ConnectorError::ConnectionTimeout { .. }
            | ConnectorError::TargetUnavailable { .. }
            | ConnectorError::NetworkError { .. }
            | ConnectorError::Internal { .. } => ErrorClass::Transient,
            ConnectorError::AuthenticationFailed
            | ConnectorError::InvalidConfiguration { .. }
            | ConnectorError::CapabilityNotSupported { .. }
            | ConnectorError::ConnectorNotFound { .. } => ErrorClass::Configuration,
            ConnectorError::ObjectClassNotFound { .. }
            | ConnectorError::AttributeNotFound { .. }
            | ConnectorError::SchemaMismatch { .. }
            | ConnectorError::TransformationFailed { .. }
            | ConnectorError::ObjectAlreadyExists { .. }
            | ConnectorError::ObjectNotFound { .. }
            | ConnectorError::ConstraintViolation { .. }
            | ConnectorError::InvalidData { .. } => ErrorClass::Data,
        }
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ConnectorError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            ConnectorError::TargetUnavailable { .. } => "TARGET_UNAVAILABLE",
            ConnectorError::NetworkError { .. } => "NETWORK_ERROR",
            ConnectorError::AuthenticationFailed => "AUTH_FAILED",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::CapabilityNotSupported { .. } => "CAPABILITY_NOT_SUPPORTED",
            ConnectorError::ConnectorNotFound { .. } => "CONNECTOR_NOT_FOUND",
            ConnectorError::ObjectClassNotFound { .. } => "OBJECT_CLASS_NOT_FOUND",
            ConnectorError::AttributeNotFound { .. } => "ATTRIBUTE_NOT_FOUND",
            ConnectorError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            ConnectorError::TransformationFailed { .. } => "TRANSFORMATION_FAILED",
            ConnectorError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            ConnectorError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            ConnectorError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            ConnectorError::InvalidData { .. } => "INVALID_DATA",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether the error describes a schema problem rather than bad values.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            ConnectorError::ObjectClassNotFound { .. }
                | ConnectorError::AttributeNotFound { .. }
                | ConnectorError::SchemaMismatch { .. }
        )
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a target unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        ConnectorError::TargetUnavailable {
            message: message.into(),
        }
    }

    /// Create an invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        ConnectorError::InvalidData {
            message: message.into(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        ConnectorError::NetworkError {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create a capability error for the named connector.
    pub fn capability_not_supported(capability: Capability, connector: impl Into<String>) -> Self {
        ConnectorError::CapabilityNotSupported {
            capability,
            connector: connector.into(),
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
