//! # Connector Capability Model
//!
//! The contract every target-system connector satisfies, and the value types
//! that travel across it.
//!
//! ## Architecture
//!
//! Connectors are heterogeneous in capability, so the contract is a base
//! trait plus narrow capability traits:
//!
//! - [`Connector`] - Base trait with runtime capability queries
//! - [`CreateOp`], [`ReadOp`], [`UpdateOp`], [`DeleteOp`] - CRUD operations
//! - [`SearchOp`] - Paged search streamed through a [`ResultsHandler`]
//! - [`SchemaDiscovery`] - Schema introspection
//!
//! Callers resolve a capability with `connector.require_create()?` and get
//! `CapabilityNotSupported` back when the connector lacks it.
//!
//! ## Example
//!
//! ```ignore
//! use idsync_connector::prelude::*;
//!
//! let registry = ConnectorRegistry::new();
//! registry.register(SystemId::new("ldap1")?, Arc::new(LdapConnector::new(settings)));
//!
//! let connector = registry.require(&system)?;
//! let uid = connector
//!     .require_create()?
//!     .create("inetOrgPerson", AttributeSet::new().with("uid", "jdoe"))
//!     .await?;
//! ```
//!
//! ## Crate Organization
//!
//! - [`ids`] - Type-safe identifiers (`SystemId`, `OperationId`, etc.)
//! - [`types`] - Operation kinds, circuit state, capabilities
//! - [`error`] - Error types with transient / configuration / data classes
//! - [`traits`] - Connector capability traits
//! - [`schema`] - Schema types and payload validation
//! - [`operation`] - Operation types (Uid, `AttributeSet`, Filter, paging)
//! - [`mapping`] - Attribute mapping definitions
//! - [`transform`] - Mapping evaluation and sandboxed script transforms
//! - [`registry`] - Connector instances keyed by system
//! - [`resilience`] - Backoff and per-call timeout

pub mod error;
pub mod ids;
pub mod mapping;
pub mod operation;
pub mod registry;
pub mod resilience;
pub mod schema;
pub mod traits;
pub mod transform;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::ids::{
        AccountId, BatchId, IdentityId, OperationId, RunId, SweepId, SyncConfigId, SystemId,
    };

    pub use crate::types::{Capability, CapabilitySet, CircuitState, OperationKind};

    pub use crate::error::{ConnectorError, ConnectorResult, ErrorClass};

    pub use crate::traits::{
        Connector, CreateOp, DeleteOp, ReadOp, SchemaDiscovery, SearchOp, SyncChange,
        SyncChangeType, UpdateOp,
    };

    pub use crate::schema::{AttributeDataType, ObjectClass, Schema, SchemaAttribute};

    pub use crate::operation::{
        AttributeDelta, AttributeSet, AttributeValue, ConnectorObject, Filter, GuardedString,
        PageRequest, ResultsHandler, SearchControl, SearchPage, Uid, PASSWORD_ATTRIBUTE,
    };

    pub use crate::registry::ConnectorRegistry;

    pub use crate::resilience::{with_timeout, BackoffPolicy};

    pub use crate::mapping::{
        AttributeSource, MappingConfiguration, MappingDirection, MappingRule, Transform,
    };

    pub use crate::transform::{ScriptLimits, TransformEngine};
}

pub use prelude::{
    Connector, CreateOp, DeleteOp, ReadOp, ResultsHandler, SchemaDiscovery, SearchOp, UpdateOp,
};

// Re-export async_trait for connector implementors
pub use async_trait::async_trait;
