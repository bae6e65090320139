//! Synchronization reconciliation engine.
//!
//! Pages through a target system, diffs every object against its
//! identity-side account and converges item by item:
//!
//! - remote-only object: create/link an account, flag it, or ignore it
//! - changed linked account: inbound mapping (minus self-inflicted echoes)
//!   or an outbound restore, depending on the mode
//! - account gone remotely (after a full pass): the missing strategy, or
//!   re-creation when the mode pushes identity state outward
//!
//! Every mutation is committed per item, so a canceled or failed run leaves
//! a consistent partial state that a fresh run converges.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use idsync_connector::ids::{IdentityId, RunId, SyncConfigId, SystemId};
use idsync_connector::mapping::MappingConfiguration;
use idsync_connector::operation::{
    AttributeSet, ConnectorObject, PageRequest, SearchControl, Uid, PASSWORD_ATTRIBUTE,
};
use idsync_connector::registry::ConnectorRegistry;
use idsync_connector::resilience::with_timeout;
use idsync_connector::traits::{Connector, SyncChange, SyncChangeType};
use idsync_connector::types::OperationKind;

use crate::clock::Clock;
use crate::echo::{EchoAspect, EchoSuppressor};
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::identity::{Account, AccountState, FlaggedObject, IdentityStore};
use crate::mapping::AttributeMapper;
use crate::queue::ProvisioningService;

use super::config::{MissingStrategy, ReconciliationMode, SyncConfigStore, SyncConfiguration, UnmatchedStrategy};
use super::error::{SyncError, SyncResult};
use super::registry::ExecutorRegistry;
use super::run::{RunHandle, RunState, RunStatistics, RunStatus};

/// Collaborators of the sync engine.
#[derive(Clone)]
pub struct SyncContext {
    pub configs: Arc<dyn SyncConfigStore>,
    pub connectors: Arc<ConnectorRegistry>,
    pub identities: Arc<dyn IdentityStore>,
    pub mapper: Arc<AttributeMapper>,
    pub echo: EchoSuppressor,
    pub provisioning: Arc<ProvisioningService>,
    pub clock: Arc<dyn Clock>,
}

struct Inner {
    ctx: SyncContext,
    registry: ExecutorRegistry,
    search_timeout: Duration,
}

/// Runs reconciliations, one per configuration at a time.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext, search_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                registry: ExecutorRegistry::new(),
                search_timeout,
            }),
        }
    }

    /// Start a run in the background.
    ///
    /// Fails with `AlreadyRunning` (carrying the existing handle) while a run
    /// for the same configuration is in progress.
    #[instrument(skip(self))]
    pub async fn start_sync(&self, config_id: SyncConfigId) -> SyncResult<RunHandle> {
        let ctx = &self.inner.ctx;
        let config = ctx
            .configs
            .get(config_id)
            .await?
            .ok_or(SyncError::ConfigNotFound { id: config_id })?;
        let system = config.system.clone();

        let connector = ctx
            .connectors
            .require(&system)
            .map_err(|e| ProvisioningError::from_connector(&system, e))?;
        connector
            .require_search()
            .map_err(|e| ProvisioningError::from_connector(&system, e))?;
        let mapping = ctx.mapper.repository().require(&system, &config.object_class)?;

        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(RunState::running(run_id, config_id, ctx.clock.now()));
        let handle = RunHandle::new(rx, cancel.clone());
        self.inner
            .registry
            .try_register(handle.clone())
            .map_err(|existing| SyncError::AlreadyRunning { existing })?;

        info!(
            run_id = %run_id,
            system = %system,
            object_class = %config.object_class,
            mode = %config.mode,
            "Started reconciliation run"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut stats = RunStatistics::default();
            let (status, error) = inner
                .execute(&config, &mapping, connector, &cancel, &tx, &mut stats)
                .await;
            // Free the slot before publishing so a waiter can start a new run at once.
            inner.registry.finish(config_id, run_id);
            let finished_at = inner.ctx.clock.now();
            tx.send_modify(|s| {
                s.status = status;
                s.error = error;
                s.statistics = stats;
                s.finished_at = Some(finished_at);
            });
            info!(
                run_id = %run_id,
                status = %status,
                processed = stats.processed,
                total = stats.total,
                created = stats.created,
                linked = stats.linked,
                updated = stats.updated,
                echoes_suppressed = stats.echoes_suppressed,
                flagged = stats.flagged,
                missing = stats.missing,
                failed = stats.failed,
                "Reconciliation run finished"
            );
        });

        Ok(handle)
    }

    /// Cancel a run; returns whether a cancelable run was found.
    pub fn cancel_sync(&self, run_id: RunId) -> bool {
        match self.inner.registry.find(run_id) {
            Some(handle) if handle.status().status.can_cancel() => {
                info!(run_id = %run_id, "Reconciliation cancel requested");
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn get_run_status(&self, run_id: RunId) -> Option<RunState> {
        self.inner.registry.status(run_id)
    }

    /// The run in progress for a configuration.
    pub fn running(&self, config_id: SyncConfigId) -> Option<RunHandle> {
        self.inner.registry.running(config_id)
    }

    /// Apply one change pushed by the target system itself.
    #[instrument(skip(self, change), fields(system = %system, uid = %change.uid, change_type = %change.change_type))]
    pub async fn handle_pushed_change(
        &self,
        system: &SystemId,
        change: SyncChange,
    ) -> SyncResult<RunStatistics> {
        let ctx = &self.inner.ctx;
        let config = ctx
            .configs
            .list()
            .await?
            .into_iter()
            .find(|c| &c.system == system && c.object_class == change.object_class)
            .ok_or_else(|| SyncError::NoConfiguration {
                system: system.clone(),
                object_class: change.object_class.clone(),
            })?;
        let mapping = ctx.mapper.repository().require(system, &config.object_class)?;

        let mut stats = RunStatistics {
            total: 1,
            ..RunStatistics::default()
        };
        match change.change_type {
            SyncChangeType::Delete => {
                match ctx
                    .identities
                    .find_account_by_uid(system, &config.object_class, &change.uid)
                    .await?
                {
                    Some(account) => self.inner.handle_missing(&config, account, &mut stats).await?,
                    None => stats.unchanged += 1,
                }
            }
            SyncChangeType::Create | SyncChangeType::Update => {
                let mut attributes = change.attributes.unwrap_or_else(AttributeSet::new);
                if attributes.remove(PASSWORD_ATTRIBUTE).is_some() {
                    self.inner
                        .observe_password(&config, &change.uid, &mut stats)
                        .await?;
                }
                let pushed: Vec<String> = attributes.names().map(String::from).collect();
                let (_, echoed) = self
                    .inner
                    .split_echoes(system, &mapping, &change.uid, &attributes, &pushed)
                    .await?;
                stats.echoes_suppressed += echoed.len() as u64;
                for name in &echoed {
                    attributes.remove(name);
                }
                if !attributes.is_empty() || change.change_type == SyncChangeType::Create {
                    let object = ConnectorObject::new(change.uid, change.object_class, attributes);
                    self.inner
                        .reconcile_object(&config, &mapping, &object, &mut stats)
                        .await?;
                }
            }
        }
        stats.processed = 1;
        Ok(stats)
    }
}

impl Inner {
    async fn execute(
        &self,
        config: &SyncConfiguration,
        mapping: &MappingConfiguration,
        connector: Arc<dyn Connector>,
        cancel: &CancellationToken,
        tx: &watch::Sender<RunState>,
        stats: &mut RunStatistics,
    ) -> (RunStatus, Option<String>) {
        let started_at = tx.borrow().started_at;
        let search = match connector.require_search() {
            Ok(search) => search,
            Err(e) => {
                return (
                    RunStatus::Failed,
                    Some(ProvisioningError::from_connector(&config.system, e).to_string()),
                )
            }
        };

        let mut seen: HashSet<_> = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return (RunStatus::Canceled, None);
            }

            let mut request = PageRequest::new(config.page_size);
            if let Some(next) = cursor.take() {
                request = request.with_cursor(next);
            }
            let mut objects = Vec::new();
            let page = {
                let mut collect = |object: ConnectorObject| {
                    objects.push(object);
                    SearchControl::Continue
                };
                with_timeout(
                    self.search_timeout,
                    search.search(&config.object_class, config.filter.as_ref(), request, &mut collect),
                )
                .await
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    let e = ProvisioningError::from_connector(&config.system, e);
                    error!(system = %config.system, error = %e, "Reconciliation search failed");
                    return (RunStatus::Failed, Some(e.to_string()));
                }
            };

            let known = stats.processed + objects.len() as u64;
            stats.total = page.total_count.unwrap_or(0).max(known);
            publish(tx, stats);
            debug!(objects = objects.len(), total = stats.total, "Reconciliation page received");

            for object in objects {
                if cancel.is_cancelled() {
                    return (RunStatus::Canceled, None);
                }
                seen.insert(object.uid.clone());
                if let Err(e) = self.reconcile_object(config, mapping, &object, stats).await {
                    stats.failed += 1;
                    warn!(uid = %object.uid, error = %e, "Failed to reconcile object");
                }
                stats.processed += 1;
                publish(tx, stats);
            }

            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }

        // Only a full pass can prove an account is gone.
        let accounts = match self
            .ctx
            .identities
            .list_accounts(&config.system, &config.object_class)
            .await
        {
            Ok(accounts) => accounts,
            Err(e) => return (RunStatus::Failed, Some(e.to_string())),
        };
        for account in accounts {
            if cancel.is_cancelled() {
                return (RunStatus::Canceled, None);
            }
            let Some(uid) = account.uid.clone() else {
                continue;
            };
            if seen.contains(&uid) {
                continue;
            }
            if let Err(e) = self.handle_missing(config, account, stats).await {
                stats.failed += 1;
                warn!(uid = %uid, error = %e, "Failed to handle missing account");
            }
            publish(tx, stats);
        }

        if let Err(e) = self.ctx.configs.record_watermark(config.id, started_at).await {
            warn!(error = %e, "Failed to record sync watermark");
        }
        (RunStatus::Completed, None)
    }

    async fn reconcile_object(
        &self,
        config: &SyncConfiguration,
        mapping: &MappingConfiguration,
        object: &ConnectorObject,
        stats: &mut RunStatistics,
    ) -> ProvisioningResult<()> {
        match self
            .ctx
            .identities
            .find_account_by_uid(&config.system, &config.object_class, &object.uid)
            .await?
        {
            Some(account) => self.reconcile_linked(config, mapping, account, object, stats).await,
            None => self.reconcile_unmatched(config, mapping, object, stats).await,
        }
    }

    async fn reconcile_linked(
        &self,
        config: &SyncConfiguration,
        mapping: &MappingConfiguration,
        mut account: Account,
        object: &ConnectorObject,
        stats: &mut RunStatistics,
    ) -> ProvisioningResult<()> {
        let mut changed = Vec::new();
        let mut settled = Vec::new();
        for (name, value) in object.attributes.iter() {
            if account.attributes.get(name) == Some(value) {
                settled.push(name.clone());
            } else {
                changed.push(name.clone());
            }
        }
        let reappeared = account.state != AccountState::Active;

        if config.mode.is_inbound() {
            // Our own write already sits in the snapshot; its marker is spent here.
            let echoing: Vec<String> = settled.into_iter().filter(|n| mapping.echoes(n)).collect();
            if !echoing.is_empty() {
                let (_, echoed) = self
                    .split_echoes(&config.system, mapping, &object.uid, &object.attributes, &echoing)
                    .await?;
                stats.echoes_suppressed += echoed.len() as u64;
            }
        }
        if changed.is_empty() && !reappeared {
            stats.unchanged += 1;
            return Ok(());
        }

        let mut applied = false;
        if config.mode.is_inbound() {
            let (fresh, echoed) = self
                .split_echoes(&config.system, mapping, &object.uid, &object.attributes, &changed)
                .await?;
            stats.echoes_suppressed += echoed.len() as u64;
            if !fresh.is_empty() {
                applied = self.apply_inbound(mapping, object, &fresh, &account.links).await?;
            }
        } else if !changed.is_empty() {
            applied = self.restore_outbound(config, &account, &changed).await?;
        }

        account.attributes.merge(object.attributes.clone());
        account.state = AccountState::Active;
        account.updated_at = self.ctx.clock.now();
        self.ctx.identities.save_account(account).await?;

        if applied || reappeared {
            stats.updated += 1;
        } else {
            stats.unchanged += 1;
        }
        Ok(())
    }

    /// Split attribute names into fresh changes and echoes of our own writes.
    ///
    /// Each matching marker is consumed.
    async fn split_echoes(
        &self,
        system: &SystemId,
        mapping: &MappingConfiguration,
        uid: &Uid,
        attributes: &AttributeSet,
        names: &[String],
    ) -> ProvisioningResult<(Vec<String>, Vec<String>)> {
        let mut fresh = Vec::new();
        let mut echoed = Vec::new();
        for name in names {
            if mapping.echoes(name) {
                let observed = attributes.get(name).map(|v| v.to_display_string());
                let aspect = EchoAspect::Attribute(name.clone());
                if self
                    .ctx
                    .echo
                    .consume(system, uid, &aspect, observed.as_deref())
                    .await?
                {
                    echoed.push(name.clone());
                    continue;
                }
            }
            fresh.push(name.clone());
        }
        Ok((fresh, echoed))
    }

    async fn apply_inbound(
        &self,
        mapping: &MappingConfiguration,
        object: &ConnectorObject,
        names: &[String],
        links: &BTreeSet<IdentityId>,
    ) -> ProvisioningResult<bool> {
        if links.is_empty() {
            return Ok(false);
        }
        let subset: AttributeSet = names
            .iter()
            .filter_map(|n| object.attributes.get(n).map(|v| (n.clone(), v.clone())))
            .collect();
        let subset = ConnectorObject::new(object.uid.clone(), object.object_class.clone(), subset);

        let mut applied = false;
        for identity in links {
            let Some(owner) = self.ctx.identities.get_identity(*identity).await? else {
                continue;
            };
            let updates: BTreeMap<String, String> = self
                .ctx
                .mapper
                .parse_inbound(&subset, mapping, &owner.attributes)?
                .into_iter()
                .filter_map(|v| v.value.map(|value| (v.identity_attribute, value)))
                .filter(|(name, value)| owner.attributes.get(name) != Some(value))
                .collect();
            if updates.is_empty() {
                continue;
            }
            debug!(
                identity = %identity,
                attributes = ?updates.keys().collect::<Vec<_>>(),
                "Applying inbound changes"
            );
            self.ctx
                .identities
                .update_identity_attributes(*identity, updates)
                .await?;
            self.ctx.mapper.invalidate_owner(*identity)?;
            applied = true;
        }
        Ok(applied)
    }

    /// Queue an update putting identity-derived values back on the target.
    async fn restore_outbound(
        &self,
        config: &SyncConfiguration,
        account: &Account,
        changed: &[String],
    ) -> ProvisioningResult<bool> {
        let Some(owner_id) = account.links.iter().next() else {
            return Ok(false);
        };
        let Some(owner) = self.ctx.identities.get_identity(*owner_id).await? else {
            return Ok(false);
        };
        let mapped = self
            .ctx
            .mapper
            .compute_outbound(
                &owner,
                &config.system,
                &config.object_class,
                OperationKind::Update,
                None,
            )
            .await?;
        let restore: AttributeSet = mapped
            .attributes
            .iter()
            .filter(|(name, _)| changed.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if restore.is_empty() {
            return Ok(false);
        }
        self.ctx
            .provisioning
            .enqueue(account.account_ref(), OperationKind::Update, restore, BTreeMap::new())
            .await?;
        Ok(true)
    }

    async fn reconcile_unmatched(
        &self,
        config: &SyncConfiguration,
        mapping: &MappingConfiguration,
        object: &ConnectorObject,
        stats: &mut RunStatistics,
    ) -> ProvisioningResult<()> {
        match config.unmatched {
            UnmatchedStrategy::Ignore => {
                stats.ignored += 1;
            }
            UnmatchedStrategy::FlagForLinking => {
                self.flag(config, object, "no linked account").await?;
                stats.flagged += 1;
            }
            UnmatchedStrategy::CreateAccount => {
                let candidates = match &config.correlation {
                    Some(correlation) => match object.attributes.get(&correlation.remote_attribute) {
                        Some(value) => {
                            self.ctx
                                .identities
                                .find_identities(&correlation.identity_attribute, &value.to_display_string())
                                .await?
                        }
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                match candidates.as_slice() {
                    [identity] => {
                        self.link(config, mapping, *identity, object).await?;
                        stats.linked += 1;
                    }
                    [] => {
                        let mut account =
                            Account::new(config.system.clone(), &config.object_class, self.ctx.clock.now())
                                .with_uid(object.uid.clone());
                        account.attributes = object.attributes.clone();
                        self.ctx.identities.save_account(account).await?;
                        stats.created += 1;
                    }
                    many => {
                        let reason = format!("correlation matched {} identities", many.len());
                        self.flag(config, object, &reason).await?;
                        stats.flagged += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn link(
        &self,
        config: &SyncConfiguration,
        mapping: &MappingConfiguration,
        identity: IdentityId,
        object: &ConnectorObject,
    ) -> ProvisioningResult<()> {
        let now = self.ctx.clock.now();
        // An assignment whose create has not landed yet is the same account.
        let pending = self
            .ctx
            .identities
            .linked_accounts(identity)
            .await?
            .into_iter()
            .find(|a| {
                a.system == config.system && a.object_class == config.object_class && a.uid.is_none()
            });
        let mut account = pending.unwrap_or_else(|| {
            Account::new(config.system.clone(), &config.object_class, now).linked_to(identity)
        });
        account.uid = Some(object.uid.clone());
        account.attributes = object.attributes.clone();
        account.state = AccountState::Active;
        account.updated_at = now;
        let links = account.links.clone();
        self.ctx.identities.save_account(account).await?;
        info!(identity = %identity, uid = %object.uid, "Linked remote object to identity");

        if config.mode.is_inbound() {
            let names: Vec<String> = object.attributes.names().map(String::from).collect();
            self.apply_inbound(mapping, object, &names, &links).await?;
        }
        Ok(())
    }

    async fn flag(
        &self,
        config: &SyncConfiguration,
        object: &ConnectorObject,
        reason: &str,
    ) -> ProvisioningResult<()> {
        debug!(uid = %object.uid, reason, "Flagging remote object for linking");
        self.ctx
            .identities
            .flag_for_linking(FlaggedObject {
                system: config.system.clone(),
                object: object.clone(),
                reason: reason.to_string(),
                flagged_at: self.ctx.clock.now(),
            })
            .await
    }

    async fn handle_missing(
        &self,
        config: &SyncConfiguration,
        mut account: Account,
        stats: &mut RunStatistics,
    ) -> ProvisioningResult<()> {
        if config.mode.is_outbound() {
            if let Some(owner_id) = account.links.iter().next().copied() {
                return self.recreate(config, &account, owner_id, stats).await;
            }
        }

        let uid = account.uid.clone();
        match config.missing {
            MissingStrategy::Ignore => {}
            MissingStrategy::MarkMissing | MissingStrategy::Disable => {
                let target = if config.missing == MissingStrategy::Disable {
                    AccountState::Disabled
                } else {
                    AccountState::Missing
                };
                if account.state != target {
                    account.state = target;
                    account.updated_at = self.ctx.clock.now();
                    self.ctx.identities.save_account(account).await?;
                    stats.missing += 1;
                    info!(uid = ?uid, state = %target, "Account missing on target");
                }
            }
            MissingStrategy::DeleteLink => {
                self.ctx.identities.delete_account(account.id).await?;
                stats.missing += 1;
                info!(uid = ?uid, "Account missing on target, link deleted");
            }
        }
        Ok(())
    }

    async fn recreate(
        &self,
        config: &SyncConfiguration,
        account: &Account,
        owner_id: IdentityId,
        stats: &mut RunStatistics,
    ) -> ProvisioningResult<()> {
        let Some(owner) = self.ctx.identities.get_identity(owner_id).await? else {
            return Ok(());
        };
        let mapped = self
            .ctx
            .mapper
            .compute_outbound(
                &owner,
                &config.system,
                &config.object_class,
                OperationKind::Create,
                None,
            )
            .await?;
        self.ctx
            .provisioning
            .enqueue(
                account.account_ref(),
                OperationKind::Create,
                mapped.attributes,
                mapped.confidential,
            )
            .await?;
        stats.restored += 1;
        info!(account = %account.account_ref(), "Account missing on target, re-creation queued");
        Ok(())
    }

    /// A pushed password change: our own echo, or an external change.
    async fn observe_password(
        &self,
        config: &SyncConfiguration,
        uid: &Uid,
        stats: &mut RunStatistics,
    ) -> ProvisioningResult<()> {
        if self
            .ctx
            .echo
            .consume(&config.system, uid, &EchoAspect::Password, None)
            .await?
        {
            stats.echoes_suppressed += 1;
            return Ok(());
        }
        if config.mode != ReconciliationMode::IdentityToSystem {
            if let Some(account) = self
                .ctx
                .identities
                .find_account_by_uid(&config.system, &config.object_class, uid)
                .await?
            {
                let now = self.ctx.clock.now();
                for identity in &account.links {
                    self.ctx.identities.record_password_change(*identity, now).await?;
                }
                stats.updated += 1;
                info!(uid = %uid, "External password change observed");
            }
        }
        Ok(())
    }
}

fn publish(tx: &watch::Sender<RunState>, stats: &RunStatistics) {
    let stats = *stats;
    tx.send_modify(|s| s.statistics = stats);
}
