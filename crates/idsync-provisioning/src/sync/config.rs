//! Sync configuration management.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use idsync_connector::ids::{SyncConfigId, SystemId};
use idsync_connector::operation::Filter;

use crate::error::{ProvisioningError, ProvisioningResult};

/// Which side a reconciliation converges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationMode {
    /// Remote state flows into identities.
    SystemToIdentity,
    /// Identity state is pushed back onto the target.
    IdentityToSystem,
    /// Inbound mapping applied, and accounts lost remotely are re-created.
    Both,
}

impl ReconciliationMode {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationMode::SystemToIdentity => "system_to_identity",
            ReconciliationMode::IdentityToSystem => "identity_to_system",
            ReconciliationMode::Both => "both",
        }
    }

    #[must_use]
    pub fn is_inbound(&self) -> bool {
        matches!(self, ReconciliationMode::SystemToIdentity | ReconciliationMode::Both)
    }

    #[must_use]
    pub fn is_outbound(&self) -> bool {
        matches!(self, ReconciliationMode::IdentityToSystem | ReconciliationMode::Both)
    }
}

impl std::fmt::Display for ReconciliationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReconciliationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system_to_identity" => Ok(ReconciliationMode::SystemToIdentity),
            "identity_to_system" => Ok(ReconciliationMode::IdentityToSystem),
            "both" => Ok(ReconciliationMode::Both),
            _ => Err(format!("Unknown reconciliation mode: {s}")),
        }
    }
}

/// What to do with a remote object no account is linked to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedStrategy {
    /// Create an account, linked when correlation finds exactly one identity.
    CreateAccount,
    /// Record the object for an administrator to link.
    #[default]
    FlagForLinking,
    Ignore,
}

/// What to do with an account whose remote object is gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingStrategy {
    #[default]
    MarkMissing,
    Disable,
    /// Drop the account record and with it every identity link.
    DeleteLink,
    Ignore,
}

/// Matches remote objects to identities by attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    /// Attribute on the remote object.
    pub remote_attribute: String,
    /// Identity attribute compared case-insensitively.
    pub identity_attribute: String,
}

/// Reconciliation settings for one (system, object class).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub id: SyncConfigId,
    pub system: SystemId,
    pub object_class: String,
    pub mode: ReconciliationMode,
    #[serde(default)]
    pub correlation: Option<Correlation>,
    #[serde(default)]
    pub unmatched: UnmatchedStrategy,
    #[serde(default)]
    pub missing: MissingStrategy,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub filter: Option<Filter>,
    /// Start of the last completed run.
    #[serde(default)]
    pub watermark: Option<DateTime<Utc>>,
}

fn default_page_size() -> u32 {
    100
}

impl SyncConfiguration {
    pub fn new(system: SystemId, object_class: impl Into<String>, mode: ReconciliationMode) -> Self {
        Self {
            id: SyncConfigId::new(),
            system,
            object_class: object_class.into(),
            mode,
            correlation: None,
            unmatched: UnmatchedStrategy::default(),
            missing: MissingStrategy::default(),
            page_size: default_page_size(),
            filter: None,
            watermark: None,
        }
    }

    #[must_use]
    pub fn with_correlation(
        mut self,
        remote_attribute: impl Into<String>,
        identity_attribute: impl Into<String>,
    ) -> Self {
        self.correlation = Some(Correlation {
            remote_attribute: remote_attribute.into(),
            identity_attribute: identity_attribute.into(),
        });
        self
    }

    #[must_use]
    pub fn with_unmatched(mut self, strategy: UnmatchedStrategy) -> Self {
        self.unmatched = strategy;
        self
    }

    #[must_use]
    pub fn with_missing(mut self, strategy: MissingStrategy) -> Self {
        self.missing = strategy;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Storage of sync configurations, edited by administrators.
#[async_trait]
pub trait SyncConfigStore: Send + Sync {
    async fn get(&self, id: SyncConfigId) -> ProvisioningResult<Option<SyncConfiguration>>;

    async fn save(&self, config: SyncConfiguration) -> ProvisioningResult<()>;

    async fn list(&self) -> ProvisioningResult<Vec<SyncConfiguration>>;

    async fn record_watermark(&self, id: SyncConfigId, at: DateTime<Utc>) -> ProvisioningResult<()>;
}

/// In-memory implementation of `SyncConfigStore` for testing.
#[derive(Debug, Default)]
pub struct InMemorySyncConfigStore {
    configs: RwLock<HashMap<SyncConfigId, SyncConfiguration>>,
}

impl InMemorySyncConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncConfigStore for InMemorySyncConfigStore {
    async fn get(&self, id: SyncConfigId) -> ProvisioningResult<Option<SyncConfiguration>> {
        Ok(self.configs.read().await.get(&id).cloned())
    }

    async fn save(&self, config: SyncConfiguration) -> ProvisioningResult<()> {
        self.configs
            .write()
            .await
            .insert(config.id, config);
        Ok(())
    }

    async fn list(&self) -> ProvisioningResult<Vec<SyncConfiguration>> {
        let mut configs: Vec<SyncConfiguration> = self
            .configs
            .read()
            .await
            .values()
            .cloned()
            .collect();
        configs.sort_by_key(|c| c.id);
        Ok(configs)
    }

    async fn record_watermark(&self, id: SyncConfigId, at: DateTime<Utc>) -> ProvisioningResult<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(&id)
            .ok_or_else(|| ProvisioningError::not_found(format!("sync configuration {id}")))?;
        config.watermark = Some(at);
        Ok(())
    }
}
