//! Connector registry.
//!
//! Process-local map from target system to its connector instance. Created
//! at startup and passed explicitly to whatever needs to resolve connectors.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ConnectorError, ConnectorResult};
use crate::ids::SystemId;
use crate::traits::Connector;

/// Registry of live connector instances keyed by system.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<SystemId, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the connector for a system.
    pub fn register(&self, system: SystemId, connector: Arc<dyn Connector>) {
        info!(
            system = %system,
            connector = connector.display_name(),
            capabilities = %connector.capabilities(),
            "Registered connector"
        );
        self.connectors.insert(system, connector);
    }

    /// Look up the connector for a system.
    #[must_use]
    pub fn get(&self, system: &SystemId) -> Option<Arc<dyn Connector>> {
        self.connectors.get(system).map(|c| Arc::clone(c.value()))
    }

    /// Look up the connector for a system or fail with `ConnectorNotFound`.
    pub fn require(&self, system: &SystemId) -> ConnectorResult<Arc<dyn Connector>> {
        self.get(system)
            .ok_or_else(|| ConnectorError::ConnectorNotFound {
                system: system.clone(),
            })
    }

    /// Remove a connector and dispose of its resources.
    pub async fn remove(&self, system: &SystemId) -> ConnectorResult<bool> {
        let Some((_, connector)) = self.connectors.remove(system) else {
            return Ok(false);
        };
        if let Err(e) = connector.dispose().await {
            warn!(system = %system, error = %e, "Connector dispose failed");
            return Err(e);
        }
        Ok(true)
    }

    /// Registered systems.
    #[must_use]
    pub fn systems(&self) -> Vec<SystemId> {
        self.connectors.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NullConnector {
        disposed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for NullConnector {
        fn display_name(&self) -> &str {
            "null"
        }

        async fn test_connection(&self) -> ConnectorResult<()> {
            Ok(())
        }

        async fn dispose(&self) -> ConnectorResult<()> {
            self.disposed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_require_remove() {
        let registry = ConnectorRegistry::new();
        let system = SystemId::new("ldap1").unwrap();
        let disposed = Arc::new(AtomicBool::new(false));

        assert!(matches!(
            registry.require(&system),
            Err(ConnectorError::ConnectorNotFound { .. })
        ));

        registry.register(
            system.clone(),
            Arc::new(NullConnector {
                disposed: disposed.clone(),
            }),
        );
        assert!(registry.require(&system).is_ok());
        assert_eq!(registry.systems(), vec![system.clone()]);

        assert!(registry.remove(&system).await.unwrap());
        assert!(disposed.load(Ordering::SeqCst));
        assert!(registry.get(&system).is_none());
        assert!(!registry.remove(&system).await.unwrap());
    }
}
