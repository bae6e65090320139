//! Engine facade.
//!
//! Builds every component from an [`EngineConfig`] and the storage
//! collaborators, and exposes the administrative and provisioning entry
//! points in one place.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use idsync_connector::ids::{BatchId, RunId, SweepId, SyncConfigId, SystemId};
use idsync_connector::mapping::MappingConfiguration;
use idsync_connector::operation::{AttributeSet, GuardedString, Uid};
use idsync_connector::registry::ConnectorRegistry;
use idsync_connector::traits::SyncChange;
use idsync_connector::transform::TransformEngine;
use idsync_connector::types::OperationKind;

use crate::breaker::{BreakerSnapshot, ProvisioningBreaker};
use crate::cache::{DistributedCache, InMemoryDistributedCache};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::echo::{EchoAspect, EchoSuppressor};
use crate::error::ProvisioningResult;
use crate::events::{IdentityEvent, ProvisioningEventHandler};
use crate::identity::{AccountRef, IdentityStore, InMemoryIdentityStore};
use crate::mapping::{AttributeMapper, MappingRepository};
use crate::queue::{
    BatchDispatcher, BatchStore, ConfidentialStore, Enqueued, InMemoryBatchStore,
    InMemoryConfidentialStore, ProvisioningBatch, ProvisioningService, QueueContext, RetrySweeper,
    SweepHandle,
};
use crate::sync::{
    InMemorySyncConfigStore, RunHandle, RunState, RunStatistics, SyncConfigStore, SyncContext,
    SyncEngine, SyncResult,
};
use crate::worker::ProvisioningWorker;

/// Storage collaborators of the engine.
#[derive(Clone)]
pub struct EngineStores {
    pub batches: Arc<dyn BatchStore>,
    pub confidential: Arc<dyn ConfidentialStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub sync_configs: Arc<dyn SyncConfigStore>,
    /// Shared by every engine instance of a deployment.
    pub cache: Arc<dyn DistributedCache>,
}

impl EngineStores {
    /// Non-durable stores for a single process.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            batches: Arc::new(InMemoryBatchStore::new()),
            confidential: Arc::new(InMemoryConfidentialStore::new()),
            identities: Arc::new(InMemoryIdentityStore::new()),
            sync_configs: Arc::new(InMemorySyncConfigStore::new()),
            cache: Arc::new(InMemoryDistributedCache::new(clock)),
        }
    }
}

/// A running provisioning worker.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop taking new work, cancel the active retry sweep and wait for
    /// in-flight dispatches.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.join.await;
    }
}

/// The provisioning and synchronization engine.
pub struct Engine {
    config: EngineConfig,
    stores: EngineStores,
    mapper: Arc<AttributeMapper>,
    echo: EchoSuppressor,
    service: Arc<ProvisioningService>,
    sweeper: RetrySweeper,
    sync: SyncEngine,
    events: ProvisioningEventHandler,
    signals: Mutex<Option<mpsc::Receiver<AccountRef>>>,
}

impl Engine {
    /// Wire the engine. Call [`Engine::spawn_worker`] to start background dispatch.
    pub fn new(
        config: EngineConfig,
        stores: EngineStores,
        connectors: Arc<ConnectorRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let repository = Arc::new(MappingRepository::new());
        let mapper = Arc::new(AttributeMapper::new(
            Arc::clone(&repository),
            TransformEngine::with_limits(&config.script.limits()),
            &config.value_cache,
        ));
        let breaker = ProvisioningBreaker::new(
            Arc::clone(&stores.cache),
            Arc::clone(&clock),
            config.breaker.clone(),
        );
        let echo = EchoSuppressor::new(Arc::clone(&stores.cache), Arc::clone(&clock), config.echo.clone());

        let queue = QueueContext {
            store: Arc::clone(&stores.batches),
            confidential: Arc::clone(&stores.confidential),
            connectors: Arc::clone(&connectors),
            identities: Arc::clone(&stores.identities),
            mappings: repository,
            breaker,
            echo: echo.clone(),
            clock: Arc::clone(&clock),
        };
        let dispatcher = Arc::new(BatchDispatcher::new(queue.clone(), &config.queue));
        let (tx, rx) = mpsc::channel(config.worker.channel_capacity);
        let service = Arc::new(
            ProvisioningService::new(queue, Arc::clone(&dispatcher), &config.queue).with_notifier(tx),
        );
        let sweeper = RetrySweeper::new(
            dispatcher,
            Arc::clone(&stores.batches),
            Arc::clone(&clock),
            config.queue.clone(),
        );
        let sync = SyncEngine::new(
            SyncContext {
                configs: Arc::clone(&stores.sync_configs),
                connectors,
                identities: Arc::clone(&stores.identities),
                mapper: Arc::clone(&mapper),
                echo: echo.clone(),
                provisioning: Arc::clone(&service),
                clock: Arc::clone(&clock),
            },
            config.queue.connector_timeout(),
        );
        let events = ProvisioningEventHandler::new(
            Arc::clone(&stores.identities),
            Arc::clone(&mapper),
            Arc::clone(&service),
            clock,
        );

        Self {
            config,
            stores,
            mapper,
            echo,
            service,
            sweeper,
            sync,
            events,
            signals: Mutex::new(Some(rx)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &EngineStores {
        &self.stores
    }

    pub fn provisioning(&self) -> &Arc<ProvisioningService> {
        &self.service
    }

    /// Start the background worker. Returns `None` if it was already started.
    pub fn spawn_worker(&self) -> Option<WorkerHandle> {
        let signals = self.signals.lock().expect("lock poisoned").take()?;
        let worker = ProvisioningWorker::new(
            Arc::clone(self.service.dispatcher()),
            self.sweeper.clone(),
            self.config.worker.clone(),
        );
        let shutdown = worker.shutdown_token();
        let join = worker.spawn(signals);
        info!(concurrency = self.config.worker.concurrency, "Provisioning worker spawned");
        Some(WorkerHandle { shutdown, join })
    }

    /// Install or replace the mapping for its (system, object class).
    pub fn put_mapping(&self, mapping: MappingConfiguration) -> ProvisioningResult<u64> {
        self.mapper.replace_mapping(mapping)
    }

    pub async fn enqueue(
        &self,
        account: AccountRef,
        kind: OperationKind,
        attributes: AttributeSet,
    ) -> ProvisioningResult<Enqueued> {
        self.service
            .enqueue(account, kind, attributes, BTreeMap::new())
            .await
    }

    /// Enqueue and wait for the account's batch to be applied.
    pub async fn provision_sync(
        &self,
        account: AccountRef,
        kind: OperationKind,
        attributes: AttributeSet,
        confidential: BTreeMap<String, GuardedString>,
    ) -> ProvisioningResult<()> {
        self.service
            .provision_sync(account, kind, attributes, confidential)
            .await
    }

    pub async fn handle_event(&self, event: IdentityEvent) -> ProvisioningResult<Vec<Enqueued>> {
        self.events.handle(event).await
    }

    /// Start a retry sweep over batches pending since before `cutoff`.
    pub fn retry_sweep(&self, cutoff: Option<DateTime<Utc>>) -> ProvisioningResult<SweepHandle> {
        self.sweeper.start(cutoff)
    }

    pub fn cancel_sweep(&self, sweep_id: SweepId) -> bool {
        self.sweeper.cancel(sweep_id)
    }

    pub async fn list_parked(&self) -> ProvisioningResult<Vec<ProvisioningBatch>> {
        self.service.list_parked().await
    }

    pub async fn requeue_parked(&self, batch_id: BatchId) -> ProvisioningResult<()> {
        self.service.requeue_parked(batch_id).await
    }

    pub async fn start_sync(&self, config_id: SyncConfigId) -> SyncResult<RunHandle> {
        self.sync.start_sync(config_id).await
    }

    pub fn cancel_sync(&self, run_id: RunId) -> bool {
        self.sync.cancel_sync(run_id)
    }

    pub fn get_run_status(&self, run_id: RunId) -> Option<RunState> {
        self.sync.get_run_status(run_id)
    }

    pub async fn handle_pushed_change(
        &self,
        system: &SystemId,
        change: SyncChange,
    ) -> SyncResult<RunStatistics> {
        self.sync.handle_pushed_change(system, change).await
    }

    pub async fn get_breaker_state(
        &self,
        system: &SystemId,
        kind: OperationKind,
    ) -> ProvisioningResult<BreakerSnapshot> {
        self.service.get_breaker_state(system, kind).await
    }

    /// Diagnostics: whether an unexpired echo marker exists.
    pub async fn echo_marker_exists(
        &self,
        system: &SystemId,
        uid: &Uid,
        aspect: &EchoAspect,
    ) -> ProvisioningResult<bool> {
        self.echo.exists(system, uid, aspect).await
    }
}
