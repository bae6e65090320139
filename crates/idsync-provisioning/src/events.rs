//! Event handlers for provisioning.
//!
//! Turns identity lifecycle events into queued provisioning operations for
//! every account the identity owns.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use idsync_connector::ids::{AccountId, IdentityId, SystemId};
use idsync_connector::operation::{AttributeSet, GuardedString, PASSWORD_ATTRIBUTE};
use idsync_connector::types::OperationKind;

use crate::clock::Clock;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::identity::{Account, Identity, IdentityStore};
use crate::mapping::AttributeMapper;
use crate::queue::{Enqueued, ProvisioningService};

/// Identity-side change that may need provisioning.
#[derive(Debug, Clone)]
pub enum IdentityEvent {
    /// Identity attributes were updated; `changed` names them.
    AttributesChanged {
        identity: IdentityId,
        changed: Vec<String>,
    },

    /// A new password was set.
    PasswordChanged {
        identity: IdentityId,
        password: GuardedString,
    },

    /// The identity should get an account on a system.
    AccountAssigned {
        identity: IdentityId,
        system: SystemId,
        object_class: String,
    },

    /// The identity no longer owns the account.
    AccountRevoked {
        identity: IdentityId,
        account: AccountId,
    },
}

impl IdentityEvent {
    #[must_use]
    pub fn identity(&self) -> IdentityId {
        match self {
            IdentityEvent::AttributesChanged { identity, .. }
            | IdentityEvent::PasswordChanged { identity, .. }
            | IdentityEvent::AccountAssigned { identity, .. }
            | IdentityEvent::AccountRevoked { identity, .. } => *identity,
        }
    }
}

/// Event handler for provisioning operations.
pub struct ProvisioningEventHandler {
    identities: Arc<dyn IdentityStore>,
    mapper: Arc<AttributeMapper>,
    service: Arc<ProvisioningService>,
    clock: Arc<dyn Clock>,
}

impl ProvisioningEventHandler {
    /// Create a new event handler.
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        mapper: Arc<AttributeMapper>,
        service: Arc<ProvisioningService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identities,
            mapper,
            service,
            clock,
        }
    }

    /// Handle one event, returning the operations it queued.
    #[instrument(skip(self, event), fields(identity = %event.identity()))]
    pub async fn handle(&self, event: IdentityEvent) -> ProvisioningResult<Vec<Enqueued>> {
        match event {
            IdentityEvent::AttributesChanged { identity, changed } => {
                self.handle_attributes_changed(identity, &changed).await
            }
            IdentityEvent::PasswordChanged { identity, password } => {
                self.handle_password_changed(identity, password).await
            }
            IdentityEvent::AccountAssigned {
                identity,
                system,
                object_class,
            } => self
                .handle_account_assigned(identity, system, object_class)
                .await
                .map(|enqueued| vec![enqueued]),
            IdentityEvent::AccountRevoked { identity, account } => {
                Ok(self.handle_account_revoked(identity, account).await?.into_iter().collect())
            }
        }
    }

    async fn require_identity(&self, id: IdentityId) -> ProvisioningResult<Identity> {
        self.identities
            .get_identity(id)
            .await?
            .ok_or_else(|| ProvisioningError::not_found(format!("identity {id}")))
    }

    async fn handle_attributes_changed(
        &self,
        identity: IdentityId,
        changed: &[String],
    ) -> ProvisioningResult<Vec<Enqueued>> {
        let owner = self.require_identity(identity).await?;
        self.mapper.invalidate_owner(identity)?;

        let mut enqueued = Vec::new();
        for account in self.identities.linked_accounts(identity).await? {
            if self.mapper.repository().get(&account.system, &account.object_class).is_none() {
                debug!(system = %account.system, "No mapping for system, skipping");
                continue;
            }
            let mapped = self
                .mapper
                .compute_outbound(
                    &owner,
                    &account.system,
                    &account.object_class,
                    OperationKind::Update,
                    Some(changed),
                )
                .await?;
            if mapped.attributes.is_empty() && mapped.confidential.is_empty() {
                continue;
            }
            enqueued.push(
                self.service
                    .enqueue(
                        account.account_ref(),
                        OperationKind::Update,
                        mapped.attributes,
                        mapped.confidential,
                    )
                    .await?,
            );
        }

        info!(count = enqueued.len(), "Queued attribute updates");
        Ok(enqueued)
    }

    async fn handle_password_changed(
        &self,
        identity: IdentityId,
        password: GuardedString,
    ) -> ProvisioningResult<Vec<Enqueued>> {
        self.identities
            .record_password_change(identity, self.clock.now())
            .await?;

        let mut enqueued = Vec::new();
        for account in self.identities.linked_accounts(identity).await? {
            let manages_password = self
                .mapper
                .repository()
                .get(&account.system, &account.object_class)
                .is_some_and(|m| m.rule(PASSWORD_ATTRIBUTE).is_some());
            if !manages_password {
                continue;
            }
            let confidential = BTreeMap::from([(PASSWORD_ATTRIBUTE.to_string(), password.clone())]);
            enqueued.push(
                self.service
                    .enqueue(
                        account.account_ref(),
                        OperationKind::Update,
                        AttributeSet::new(),
                        confidential,
                    )
                    .await?,
            );
        }

        info!(count = enqueued.len(), "Queued password updates");
        Ok(enqueued)
    }

    async fn handle_account_assigned(
        &self,
        identity: IdentityId,
        system: SystemId,
        object_class: String,
    ) -> ProvisioningResult<Enqueued> {
        let owner = self.require_identity(identity).await?;
        let mapped = self
            .mapper
            .compute_outbound(&owner, &system, &object_class, OperationKind::Create, None)
            .await?;

        let account = Account::new(system, object_class, self.clock.now()).linked_to(identity);
        let account_ref = account.account_ref();
        self.identities.save_account(account).await?;

        info!(account = %account_ref, "Queued account creation");
        self.service
            .enqueue(
                account_ref,
                OperationKind::Create,
                mapped.attributes,
                mapped.confidential,
            )
            .await
    }

    async fn handle_account_revoked(
        &self,
        identity: IdentityId,
        account_id: AccountId,
    ) -> ProvisioningResult<Option<Enqueued>> {
        let Some(mut account) = self.identities.get_account(account_id).await? else {
            return Err(ProvisioningError::not_found(format!("account {account_id}")));
        };
        account.links.remove(&identity);
        let remaining = account.links.len();
        let account_ref = account.account_ref();
        self.identities.save_account(account).await?;

        if remaining > 0 {
            debug!(account = %account_ref, remaining, "Account still linked, not deleting");
            return Ok(None);
        }

        info!(account = %account_ref, "Queued account deletion");
        self.service
            .enqueue(
                account_ref,
                OperationKind::Delete,
                AttributeSet::new(),
                BTreeMap::new(),
            )
            .await
            .map(Some)
    }
}
