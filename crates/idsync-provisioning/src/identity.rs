//! Identity-side store contract.
//!
//! Identities and accounts are owned by the platform; the engine only reads
//! them and applies the mutations that provisioning and reconciliation
//! produce.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tokio::sync::RwLock;

use idsync_connector::ids::{AccountId, IdentityId, SystemId};
use idsync_connector::operation::{AttributeSet, ConnectorObject, Uid};

use crate::error::{ProvisioningError, ProvisioningResult};

/// An identity and its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub attributes: BTreeMap<String, String>,
    pub password_changed_at: Option<DateTime<Utc>>,
}

impl Identity {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: IdentityId::new(),
            attributes: BTreeMap::new(),
            password_changed_at: None,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of an account as seen by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Active,
    /// Not found on the target during the last full reconciliation.
    Missing,
    Disabled,
}

impl AccountState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountState::Active => "active",
            AccountState::Missing => "missing",
            AccountState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identity's representation on one target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub system: SystemId,
    pub object_class: String,
    /// Assigned by the target on first successful create or discovery.
    pub uid: Option<Uid>,
    pub state: AccountState,
    /// Last known target-side attribute values.
    pub attributes: AttributeSet,
    pub links: BTreeSet<IdentityId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(system: SystemId, object_class: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: AccountId::new(),
            system,
            object_class: object_class.into(),
            uid: None,
            state: AccountState::Active,
            attributes: AttributeSet::new(),
            links: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    #[must_use]
    pub fn linked_to(mut self, identity: IdentityId) -> Self {
        self.links.insert(identity);
        self
    }

    #[must_use]
    pub fn account_ref(&self) -> AccountRef {
        AccountRef {
            system: self.system.clone(),
            object_class: self.object_class.clone(),
            account_id: self.id,
        }
    }
}

/// Reference to an account used by the provisioning queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountRef {
    pub system: SystemId,
    pub object_class: String,
    pub account_id: AccountId,
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.system, self.object_class, self.account_id)
    }
}

/// A remote object no identity could be linked to automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedObject {
    pub system: SystemId,
    pub object: ConnectorObject,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

/// Identity and account storage.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_identity(&self, id: IdentityId) -> ProvisioningResult<Option<Identity>>;

    /// Identities whose attribute `name` equals `value`.
    async fn find_identities(&self, name: &str, value: &str)
        -> ProvisioningResult<Vec<IdentityId>>;

    /// Merge attribute values into an identity.
    async fn update_identity_attributes(
        &self,
        id: IdentityId,
        attributes: BTreeMap<String, String>,
    ) -> ProvisioningResult<()>;

    async fn record_password_change(
        &self,
        id: IdentityId,
        at: DateTime<Utc>,
    ) -> ProvisioningResult<()>;

    async fn get_account(&self, id: AccountId) -> ProvisioningResult<Option<Account>>;

    async fn find_account_by_uid(
        &self,
        system: &SystemId,
        object_class: &str,
        uid: &Uid,
    ) -> ProvisioningResult<Option<Account>>;

    async fn list_accounts(
        &self,
        system: &SystemId,
        object_class: &str,
    ) -> ProvisioningResult<Vec<Account>>;

    /// Accounts linked to an identity.
    async fn linked_accounts(&self, identity: IdentityId) -> ProvisioningResult<Vec<Account>>;

    /// Insert or replace an account.
    async fn save_account(&self, account: Account) -> ProvisioningResult<()>;

    async fn delete_account(&self, id: AccountId) -> ProvisioningResult<bool>;

    async fn flag_for_linking(&self, flagged: FlaggedObject) -> ProvisioningResult<()>;

    async fn list_flagged(&self, system: &SystemId) -> ProvisioningResult<Vec<FlaggedObject>>;
}

/// In-memory implementation of `IdentityStore` for testing.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    identities: RwLock<HashMap<IdentityId, Identity>>,
    accounts: RwLock<HashMap<AccountId, Account>>,
    flagged: RwLock<Vec<FlaggedObject>>,
}

impl InMemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an identity (for testing).
    pub async fn insert_identity(&self, identity: Identity) {
        self.identities
            .write()
            .await
            .insert(identity.id, identity);
    }

    /// Seed an account (for testing).
    pub async fn insert_account(&self, account: Account) {
        self.accounts
            .write()
            .await
            .insert(account.id, account);
    }

    /// Get all accounts (for testing).
    pub async fn all_accounts(&self) -> Vec<Account> {
        self.accounts
            .read()
            .await
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn get_identity(&self, id: IdentityId) -> ProvisioningResult<Option<Identity>> {
        Ok(self
            .identities
            .read()
            .await
            .get(&id)
            .cloned())
    }

    async fn find_identities(
        &self,
        name: &str,
        value: &str,
    ) -> ProvisioningResult<Vec<IdentityId>> {
        let mut found: Vec<IdentityId> = self
            .identities
            .read()
            .await
            .values()
            .filter(|i| i.attributes.get(name).is_some_and(|v| v.eq_ignore_ascii_case(value)))
            .map(|i| i.id)
            .collect();
        found.sort();
        Ok(found)
    }

    async fn update_identity_attributes(
        &self,
        id: IdentityId,
        attributes: BTreeMap<String, String>,
    ) -> ProvisioningResult<()> {
        let mut identities = self.identities.write().await;
        let identity = identities
            .get_mut(&id)
            .ok_or_else(|| ProvisioningError::not_found(format!("identity {id}")))?;
        identity.attributes.extend(attributes);
        Ok(())
    }

    async fn record_password_change(
        &self,
        id: IdentityId,
        at: DateTime<Utc>,
    ) -> ProvisioningResult<()> {
        let mut identities = self.identities.write().await;
        let identity = identities
            .get_mut(&id)
            .ok_or_else(|| ProvisioningError::not_found(format!("identity {id}")))?;
        identity.password_changed_at = Some(at);
        Ok(())
    }

    async fn get_account(&self, id: AccountId) -> ProvisioningResult<Option<Account>> {
        Ok(self.accounts.read().await.get(&id).cloned())
    }

    async fn find_account_by_uid(
        &self,
        system: &SystemId,
        object_class: &str,
        uid: &Uid,
    ) -> ProvisioningResult<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| {
                &a.system == system && a.object_class == object_class && a.uid.as_ref() == Some(uid)
            })
            .cloned())
    }

    async fn list_accounts(
        &self,
        system: &SystemId,
        object_class: &str,
    ) -> ProvisioningResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .read()
            .await
            .values()
            .filter(|a| &a.system == system && a.object_class == object_class)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| (a.created_at, a.id));
        Ok(accounts)
    }

    async fn linked_accounts(&self, identity: IdentityId) -> ProvisioningResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .read()
            .await
            .values()
            .filter(|a| a.links.contains(&identity))
            .cloned()
            .collect();
        accounts.sort_by_key(|a| (a.created_at, a.id));
        Ok(accounts)
    }

    async fn save_account(&self, account: Account) -> ProvisioningResult<()> {
        self.accounts
            .write()
            .await
            .insert(account.id, account);
        Ok(())
    }

    async fn delete_account(&self, id: AccountId) -> ProvisioningResult<bool> {
        Ok(self
            .accounts
            .write()
            .await
            .remove(&id)
            .is_some())
    }

    async fn flag_for_linking(&self, flagged: FlaggedObject) -> ProvisioningResult<()> {
        let mut all = self.flagged.write().await;
        // Re-running a reconciliation must not pile up duplicates.
        all.retain(|f| !(f.system == flagged.system && f.object.uid == flagged.object.uid));
        all.push(flagged);
        Ok(())
    }

    async fn list_flagged(&self, system: &SystemId) -> ProvisioningResult<Vec<FlaggedObject>> {
        Ok(self
            .flagged
            .read()
            .await
            .iter()
            .filter(|f| &f.system == system)
            .cloned()
            .collect())
    }
}
