//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::Semaphore;

use idsync_connector::error::{ConnectorError, ConnectorResult};
use idsync_connector::ids::{BatchId, OperationId, SystemId};
use idsync_connector::mapping::{MappingConfiguration, MappingRule};
use idsync_connector::operation::{
    AttributeDelta, AttributeSet, AttributeValue, ConnectorObject, Filter, PageRequest,
    ResultsHandler, SearchControl, SearchPage, Uid, PASSWORD_ATTRIBUTE,
};
use idsync_connector::registry::ConnectorRegistry;
use idsync_connector::traits::{Connector, CreateOp, DeleteOp, SearchOp, UpdateOp};

use idsync_provisioning::queue::{BatchError, SweepCursor};
use idsync_provisioning::{
    Account, AccountRef, BatchStore, Clock, Engine, EngineConfig, EngineStores, Identity,
    InMemoryBatchStore, InMemoryConfidentialStore, InMemoryDistributedCache,
    InMemoryIdentityStore, InMemorySyncConfigStore, ManualClock, OperationRecord,
    ProvisioningBatch, ProvisioningError, ProvisioningOperation, ProvisioningResult,
};

pub const OBJECT_CLASS: &str = "inetOrgPerson";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// =============================================================================
// Mock Directory Connector
// =============================================================================

/// In-memory directory with switchable failures and call counters.
pub struct MockDirectory {
    name: String,
    writable: bool,
    objects: Mutex<BTreeMap<Uid, AttributeSet>>,
    next_id: AtomicUsize,
    pub fail_writes: AtomicBool,
    pub fail_search: AtomicBool,
    pub create_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub updates: Mutex<Vec<(Uid, AttributeDelta)>>,
    pub creates: Mutex<Vec<AttributeSet>>,
    /// When set, every search page waits for one permit.
    search_gate: Mutex<Option<Arc<Semaphore>>>,
    /// When set, every update waits for one permit.
    write_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockDirectory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            writable: true,
            objects: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(1),
            fail_writes: AtomicBool::new(false),
            fail_search: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
            creates: Mutex::new(Vec::new()),
            search_gate: Mutex::new(None),
            write_gate: Mutex::new(None),
        }
    }

    /// Search only: no create, update or delete capability.
    pub fn read_only(name: &str) -> Self {
        Self {
            writable: false,
            ..Self::new(name)
        }
    }

    pub fn put_object(&self, uid: &Uid, attributes: AttributeSet) {
        self.objects.lock().unwrap().insert(uid.clone(), attributes);
    }

    pub fn remove_object(&self, uid: &Uid) {
        self.objects.lock().unwrap().remove(uid);
    }

    pub fn object(&self, uid: &Uid) -> Option<AttributeSet> {
        self.objects.lock().unwrap().get(uid).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn gate_search(&self, gate: Arc<Semaphore>) {
        *self.search_gate.lock().unwrap() = Some(gate);
    }

    pub fn ungate_search(&self) {
        *self.search_gate.lock().unwrap() = None;
    }

    pub fn gate_writes(&self, gate: Arc<Semaphore>) {
        *self.write_gate.lock().unwrap() = Some(gate);
    }

    pub fn ungate_writes(&self) {
        *self.write_gate.lock().unwrap() = None;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn last_update(&self) -> Option<(Uid, AttributeDelta)> {
        self.updates.lock().unwrap().last().cloned()
    }

    async fn pass_gate(gate: &Mutex<Option<Arc<Semaphore>>>) -> ConnectorResult<()> {
        let gate = gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| ConnectorError::internal("gate closed"))?
                .forget();
        }
        Ok(())
    }

    fn check_writes(&self) -> ConnectorResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(ConnectorError::unavailable("directory is down"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connector for MockDirectory {
    fn display_name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        Ok(())
    }

    fn as_create(&self) -> Option<&dyn CreateOp> {
        self.writable.then_some(self as &dyn CreateOp)
    }

    fn as_update(&self) -> Option<&dyn UpdateOp> {
        self.writable.then_some(self as &dyn UpdateOp)
    }

    fn as_delete(&self) -> Option<&dyn DeleteOp> {
        self.writable.then_some(self as &dyn DeleteOp)
    }

    fn as_search(&self) -> Option<&dyn SearchOp> {
        Some(self)
    }
}

#[async_trait]
impl CreateOp for MockDirectory {
    async fn create(&self, _object_class: &str, attributes: AttributeSet) -> ConnectorResult<Uid> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writes()?;
        let uid = match attributes.get_string("uid") {
            Some(value) => Uid::from_value(value),
            None => Uid::from_value(format!("u{}", self.next_id.fetch_add(1, Ordering::SeqCst))),
        };
        self.creates.lock().unwrap().push(attributes.clone());
        let mut stored = attributes;
        stored.remove(PASSWORD_ATTRIBUTE);
        self.put_object(&uid, stored);
        Ok(uid)
    }
}

#[async_trait]
impl UpdateOp for MockDirectory {
    async fn update(
        &self,
        _object_class: &str,
        uid: &Uid,
        changes: AttributeDelta,
    ) -> ConnectorResult<Uid> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        Self::pass_gate(&self.write_gate).await?;
        self.check_writes()?;
        {
            let mut objects = self.objects.lock().unwrap();
            let object = objects
                .get_mut(uid)
                .ok_or_else(|| ConnectorError::ObjectNotFound {
                    identifier: uid.to_string(),
                })?;
            for (name, value) in &changes.replace {
                if name != PASSWORD_ATTRIBUTE {
                    object.set(name.clone(), value.clone());
                }
            }
            for name in &changes.clear {
                object.remove(name);
            }
        }
        self.updates.lock().unwrap().push((uid.clone(), changes));
        Ok(uid.clone())
    }
}

#[async_trait]
impl DeleteOp for MockDirectory {
    async fn delete(&self, _object_class: &str, uid: &Uid) -> ConnectorResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writes()?;
        self.remove_object(uid);
        Ok(())
    }
}

#[async_trait]
impl SearchOp for MockDirectory {
    async fn search(
        &self,
        object_class: &str,
        _filter: Option<&Filter>,
        page: PageRequest,
        handler: &mut dyn ResultsHandler,
    ) -> ConnectorResult<SearchPage> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        Self::pass_gate(&self.search_gate).await?;
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(ConnectorError::unavailable("directory is down"));
        }

        let snapshot: Vec<(Uid, AttributeSet)> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(uid, attrs)| (uid.clone(), attrs.clone()))
            .collect();
        let start: usize = page.cursor.as_deref().map_or(0, |c| c.parse().unwrap_or(0));
        let end = (start + page.page_size as usize).min(snapshot.len());
        for (uid, attributes) in &snapshot[start..end] {
            let object = ConnectorObject::new(uid.clone(), object_class, attributes.clone());
            if handler.handle(object) == SearchControl::Stop {
                break;
            }
        }

        let result = SearchPage::last().with_total_count(snapshot.len() as u64);
        Ok(if end < snapshot.len() {
            result.with_next_cursor(end.to_string())
        } else {
            result
        })
    }
}

// =============================================================================
// Batch Store With Injected History Failures
// =============================================================================

/// Delegates to an [`InMemoryBatchStore`]; the next `record_failures`
/// history writes fail with a storage error.
pub struct FlakyHistoryStore {
    inner: Arc<InMemoryBatchStore>,
    pub record_failures: AtomicUsize,
}

impl FlakyHistoryStore {
    pub fn new(inner: Arc<InMemoryBatchStore>) -> Self {
        Self {
            inner,
            record_failures: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_records(&self, count: usize) {
        self.record_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl BatchStore for FlakyHistoryStore {
    async fn enqueue(&self, operation: ProvisioningOperation) -> ProvisioningResult<BatchId> {
        self.inner.enqueue(operation).await
    }

    async fn claim(&self, account: &AccountRef) -> ProvisioningResult<Option<ProvisioningBatch>> {
        self.inner.claim(account).await
    }

    async fn complete(&self, batch_id: BatchId) -> ProvisioningResult<()> {
        self.inner.complete(batch_id).await
    }

    async fn release(
        &self,
        batch_id: BatchId,
        remaining: Vec<ProvisioningOperation>,
        error: BatchError,
        attempted: bool,
    ) -> ProvisioningResult<()> {
        self.inner.release(batch_id, remaining, error, attempted).await
    }

    async fn park(
        &self,
        batch_id: BatchId,
        remaining: Vec<ProvisioningOperation>,
        error: BatchError,
    ) -> ProvisioningResult<()> {
        self.inner.park(batch_id, remaining, error).await
    }

    async fn requeue_parked(&self, batch_id: BatchId) -> ProvisioningResult<()> {
        self.inner.requeue_parked(batch_id).await
    }

    async fn get(&self, batch_id: BatchId) -> ProvisioningResult<Option<ProvisioningBatch>> {
        self.inner.get(batch_id).await
    }

    async fn get_for_account(
        &self,
        account: &AccountRef,
    ) -> ProvisioningResult<Option<ProvisioningBatch>> {
        self.inner.get_for_account(account).await
    }

    async fn list_pending_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<SweepCursor>,
        limit: usize,
    ) -> ProvisioningResult<Vec<ProvisioningBatch>> {
        self.inner.list_pending_before(cutoff, after, limit).await
    }

    async fn count_pending_before(&self, cutoff: DateTime<Utc>) -> ProvisioningResult<u64> {
        self.inner.count_pending_before(cutoff).await
    }

    async fn list_parked(&self) -> ProvisioningResult<Vec<ProvisioningBatch>> {
        self.inner.list_parked().await
    }

    async fn record(&self, record: OperationRecord) -> ProvisioningResult<()> {
        let failing = self
            .record_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProvisioningError::storage("history unavailable"));
        }
        self.inner.record(record).await
    }

    async fn history(&self, account: &AccountRef) -> ProvisioningResult<Vec<OperationRecord>> {
        self.inner.history(account).await
    }

    async fn latest_record(
        &self,
        operation_id: OperationId,
    ) -> ProvisioningResult<Option<OperationRecord>> {
        self.inner.latest_record(operation_id).await
    }
}

// =============================================================================
// Engine Harness
// =============================================================================

pub struct Harness {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub directory: Arc<MockDirectory>,
    pub identities: Arc<InMemoryIdentityStore>,
    pub batches: Arc<InMemoryBatchStore>,
    pub history: Arc<FlakyHistoryStore>,
    pub configs: Arc<InMemorySyncConfigStore>,
    pub system: SystemId,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_directory(config, MockDirectory::new("ldap1"))
    }

    pub fn with_directory(config: EngineConfig, directory: MockDirectory) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
        let system = SystemId::new("ldap1").unwrap();
        let directory = Arc::new(directory);
        let connectors = Arc::new(ConnectorRegistry::new());
        connectors.register(system.clone(), Arc::clone(&directory) as Arc<dyn Connector>);

        let identities = Arc::new(InMemoryIdentityStore::new());
        let batches = Arc::new(InMemoryBatchStore::new());
        let history = Arc::new(FlakyHistoryStore::new(Arc::clone(&batches)));
        let configs = Arc::new(InMemorySyncConfigStore::new());
        let stores = EngineStores {
            batches: Arc::clone(&history) as _,
            confidential: Arc::new(InMemoryConfidentialStore::new()),
            identities: Arc::clone(&identities) as _,
            sync_configs: Arc::clone(&configs) as _,
            cache: Arc::new(InMemoryDistributedCache::new(Arc::clone(&clock) as _)),
        };
        let engine = Engine::new(config, stores, connectors, Arc::clone(&clock) as _);
        engine.put_mapping(default_mapping(&system)).unwrap();

        Self {
            engine,
            clock,
            directory,
            identities,
            batches,
            history,
            configs,
            system,
        }
    }

    /// An identity with a linked account already present on the target.
    pub async fn linked_account(&self, login: &str, email: &str) -> (Identity, Account) {
        let identity = Identity::new()
            .with_attribute("login", login)
            .with_attribute("email", email)
            .with_attribute("name", login.to_uppercase());
        self.identities.insert_identity(identity.clone()).await;

        let uid = Uid::from_value(login);
        let attributes = AttributeSet::new()
            .with("uid", login)
            .with("mail", email)
            .with("cn", login.to_uppercase());
        self.directory.put_object(&uid, attributes.clone());

        let mut account = Account::new(self.system.clone(), OBJECT_CLASS, self.clock.now())
            .with_uid(uid)
            .linked_to(identity.id);
        account.attributes = attributes;
        self.identities.insert_account(account.clone()).await;
        (identity, account)
    }

    /// A reference to an account that does not exist yet.
    pub fn new_account_ref(&self) -> AccountRef {
        Account::new(self.system.clone(), OBJECT_CLASS, self.clock.now()).account_ref()
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

/// uid and cn are plain, mail echoes back, the password is confidential and echoes.
pub fn default_mapping(system: &SystemId) -> MappingConfiguration {
    MappingConfiguration::new(
        system.clone(),
        OBJECT_CLASS,
        vec![
            MappingRule::direct("uid", "login"),
            MappingRule::direct("mail", "email").echoing(),
            MappingRule::direct("cn", "name"),
            MappingRule::direct(PASSWORD_ATTRIBUTE, "password")
                .confidential()
                .echoing(),
        ],
    )
}

pub fn attrs(pairs: &[(&str, &str)]) -> AttributeSet {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), AttributeValue::from(*v)))
        .collect()
}

/// Engine configuration with a small breaker and short timeouts.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.breaker.warning_threshold = 2;
    config.breaker.block_threshold = 3;
    config.breaker.initial_backoff_secs = 60;
    config.breaker.max_backoff_secs = 600;
    config.queue.connector_timeout_ms = 2_000;
    config.queue.sync_timeout_ms = 5_000;
    config
}
