//! Confidential value storage.
//!
//! Passwords and other confidential mapped values never enter the queued
//! payload or the operation history. They are parked here under the id of
//! the operation that produced them and resolved only at dispatch.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use idsync_connector::ids::OperationId;
use idsync_connector::operation::GuardedString;

use crate::error::ProvisioningResult;

#[async_trait]
pub trait ConfidentialStore: Send + Sync {
    async fn put(
        &self,
        operation: OperationId,
        values: BTreeMap<String, GuardedString>,
    ) -> ProvisioningResult<()>;

    /// Values of several operations, later ones overriding earlier ones.
    async fn resolve(
        &self,
        operations: &[OperationId],
    ) -> ProvisioningResult<BTreeMap<String, GuardedString>>;

    async fn remove(&self, operations: &[OperationId]) -> ProvisioningResult<()>;
}

/// In-memory implementation of `ConfidentialStore` for testing.
#[derive(Debug, Default)]
pub struct InMemoryConfidentialStore {
    values: RwLock<HashMap<OperationId, BTreeMap<String, GuardedString>>>,
}

impl InMemoryConfidentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ConfidentialStore for InMemoryConfidentialStore {
    async fn put(
        &self,
        operation: OperationId,
        values: BTreeMap<String, GuardedString>,
    ) -> ProvisioningResult<()> {
        self.values
            .write()
            .await
            .insert(operation, values);
        Ok(())
    }

    async fn resolve(
        &self,
        operations: &[OperationId],
    ) -> ProvisioningResult<BTreeMap<String, GuardedString>> {
        let values = self.values.read().await;
        let mut resolved = BTreeMap::new();
        for id in operations {
            if let Some(found) = values.get(id) {
                resolved.extend(found.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Ok(resolved)
    }

    async fn remove(&self, operations: &[OperationId]) -> ProvisioningResult<()> {
        let mut values = self.values.write().await;
        for id in operations {
            values.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_later_overrides_earlier() {
        let store = InMemoryConfidentialStore::new();
        let first = OperationId::new();
        let second = OperationId::new();
        store
            .put(first, BTreeMap::from([("__PASSWORD__".to_string(), GuardedString::new("old"))]))
            .await
            .unwrap();
        store
            .put(second, BTreeMap::from([("__PASSWORD__".to_string(), GuardedString::new("new"))]))
            .await
            .unwrap();

        let resolved = store.resolve(&[first, second, OperationId::new()]).await.unwrap();
        assert_eq!(resolved["__PASSWORD__"].expose(), "new");

        store.remove(&[first, second]).await.unwrap();
        assert!(store.is_empty().await);
    }
}
