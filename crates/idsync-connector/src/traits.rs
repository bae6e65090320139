//! Connector capability traits
//!
//! A connector implements [`Connector`] plus whichever narrow capability
//! traits its target supports. The engine discovers capabilities at runtime
//! through the `as_*` queries and never assumes one exists.

use async_trait::async_trait;

use crate::error::{ConnectorError, ConnectorResult};
use crate::operation::{
    AttributeDelta, AttributeSet, ConnectorObject, Filter, PageRequest, ResultsHandler, SearchPage,
    Uid,
};
use crate::schema::Schema;
use crate::types::{Capability, CapabilitySet};

/// Base trait for all connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Get the display name for this connector instance.
    fn display_name(&self) -> &str;

    /// Test the connection to the target system.
    async fn test_connection(&self) -> ConnectorResult<()>;

    /// Dispose of connector resources.
    ///
    /// Called when the connector is being removed from the registry.
    async fn dispose(&self) -> ConnectorResult<()> {
        Ok(())
    }

    /// Lightweight health check.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Capability query for [`CreateOp`].
    fn as_create(&self) -> Option<&dyn CreateOp> {
        None
    }

    /// Capability query for [`ReadOp`].
    fn as_read(&self) -> Option<&dyn ReadOp> {
        None
    }

    /// Capability query for [`UpdateOp`].
    fn as_update(&self) -> Option<&dyn UpdateOp> {
        None
    }

    /// Capability query for [`DeleteOp`].
    fn as_delete(&self) -> Option<&dyn DeleteOp> {
        None
    }

    /// Capability query for [`SearchOp`].
    fn as_search(&self) -> Option<&dyn SearchOp> {
        None
    }

    /// Capability query for [`SchemaDiscovery`].
    fn as_schema(&self) -> Option<&dyn SchemaDiscovery> {
        None
    }

    /// The capabilities this instance exposes, derived from the queries above.
    fn capabilities(&self) -> CapabilitySet {
        let mut set = CapabilitySet::empty();
        if self.as_create().is_some() {
            set = set.with(Capability::Create);
        }
        if self.as_read().is_some() {
            set = set.with(Capability::Read);
        }
        if self.as_update().is_some() {
            set = set.with(Capability::Update);
        }
        if self.as_delete().is_some() {
            set = set.with(Capability::Delete);
        }
        if self.as_search().is_some() {
            set = set.with(Capability::Search);
        }
        if self.as_schema().is_some() {
            set = set.with(Capability::Schema);
        }
        set
    }
}

impl dyn Connector {
    fn unsupported(&self, capability: Capability) -> ConnectorError {
        ConnectorError::capability_not_supported(capability, self.display_name())
    }

    /// Resolve [`CreateOp`] or fail fast.
    pub fn require_create(&self) -> ConnectorResult<&dyn CreateOp> {
        self.as_create()
            .ok_or_else(|| self.unsupported(Capability::Create))
    }

    /// Resolve [`ReadOp`] or fail fast.
    pub fn require_read(&self) -> ConnectorResult<&dyn ReadOp> {
        self.as_read().ok_or_else(|| self.unsupported(Capability::Read))
    }

    /// Resolve [`UpdateOp`] or fail fast.
    pub fn require_update(&self) -> ConnectorResult<&dyn UpdateOp> {
        self.as_update()
            .ok_or_else(|| self.unsupported(Capability::Update))
    }

    /// Resolve [`DeleteOp`] or fail fast.
    pub fn require_delete(&self) -> ConnectorResult<&dyn DeleteOp> {
        self.as_delete()
            .ok_or_else(|| self.unsupported(Capability::Delete))
    }

    /// Resolve [`SearchOp`] or fail fast.
    pub fn require_search(&self) -> ConnectorResult<&dyn SearchOp> {
        self.as_search()
            .ok_or_else(|| self.unsupported(Capability::Search))
    }

    /// Resolve [`SchemaDiscovery`] or fail fast.
    pub fn require_schema(&self) -> ConnectorResult<&dyn SchemaDiscovery> {
        self.as_schema()
            .ok_or_else(|| self.unsupported(Capability::Schema))
    }
}

/// Capability for discovering the schema of a target system.
#[async_trait]
pub trait SchemaDiscovery: Connector {
    /// Discover the schema from the target system.
    async fn discover_schema(&self) -> ConnectorResult<Schema>;
}

/// Capability for creating objects in the target system.
#[async_trait]
pub trait CreateOp: Connector {
    /// Create a new object and return the UID the target assigned.
    ///
    /// Implementations should treat a repeated create for an object that
    /// already exists with the same naming attribute as success.
    async fn create(&self, object_class: &str, attributes: AttributeSet) -> ConnectorResult<Uid>;
}

/// Capability for reading a single object by UID.
#[async_trait]
pub trait ReadOp: Connector {
    /// Fetch one object, `None` when the target has no such object.
    async fn get(&self, object_class: &str, uid: &Uid) -> ConnectorResult<Option<ConnectorObject>>;
}

/// Capability for updating objects in the target system.
#[async_trait]
pub trait UpdateOp: Connector {
    /// Apply changes; returns the UID, which some systems change on rename.
    async fn update(
        &self,
        object_class: &str,
        uid: &Uid,
        changes: AttributeDelta,
    ) -> ConnectorResult<Uid>;
}

/// Capability for deleting objects from the target system.
#[async_trait]
pub trait DeleteOp: Connector {
    /// Delete an object. Deleting an absent object should succeed.
    async fn delete(&self, object_class: &str, uid: &Uid) -> ConnectorResult<()>;
}

/// Capability for searching objects in the target system.
///
/// Results are streamed one page at a time into a [`ResultsHandler`]; the
/// returned [`SearchPage`] says how to fetch the next page.
#[async_trait]
pub trait SearchOp: Connector {
    async fn search(
        &self,
        object_class: &str,
        filter: Option<&Filter>,
        page: PageRequest,
        handler: &mut dyn ResultsHandler,
    ) -> ConnectorResult<SearchPage>;
}

/// A change reported by a target system through its own notification channel.
#[derive(Debug, Clone)]
pub struct SyncChange {
    /// The unique identifier of the changed object.
    pub uid: Uid,
    /// The type of change.
    pub change_type: SyncChangeType,
    /// The object class (e.g., "user", "group").
    pub object_class: String,
    /// The current (or changed) attributes of the object.
    pub attributes: Option<AttributeSet>,
    /// Timestamp of the change (if provided by the source system).
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl SyncChange {
    /// A change for a created object.
    pub fn created(uid: Uid, object_class: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            uid,
            change_type: SyncChangeType::Create,
            object_class: object_class.into(),
            attributes: Some(attributes),
            timestamp: None,
        }
    }

    /// A change for an updated object.
    pub fn updated(uid: Uid, object_class: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            uid,
            change_type: SyncChangeType::Update,
            object_class: object_class.into(),
            attributes: Some(attributes),
            timestamp: None,
        }
    }

    /// A change for a deleted object.
    pub fn deleted(uid: Uid, object_class: impl Into<String>) -> Self {
        Self {
            uid,
            change_type: SyncChangeType::Delete,
            object_class: object_class.into(),
            attributes: None,
            timestamp: None,
        }
    }

    /// Set the timestamp of the change.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Type of change reported by a target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncChangeType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for SyncChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncChangeType::Create => write!(f, "create"),
            SyncChangeType::Update => write!(f, "update"),
            SyncChangeType::Delete => write!(f, "delete"),
        }
    }
}
