//! # Provisioning Engine
//!
//! Pushes identity changes to target systems and reconciles the drift that
//! accumulates anyway.
//!
//! This crate provides:
//! - Per-account batching of pending operations (last write wins per attribute)
//! - A circuit breaker per (system, operation kind) in a shared cache
//! - Echo suppression for changes the targets report back
//! - A retry sweep, a bounded dispatch worker and synchronous provisioning
//! - A reconciliation engine with cooperative cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌───────────────┐
//! │ Identity Events │────►│  Batch Store │────►│  Dispatcher   │
//! │                 │     │ (per account)│     │               │
//! └─────────────────┘     └──────▲───────┘     └───────┬───────┘
//!                                │                     │
//!                         ┌──────┴───────┐      ┌──────▼────────┐      ┌─────────────┐
//!                         │ Retry Sweep  │      │    Breaker    │─────►│  Connector  │
//!                         │   Worker     │      │  Echo Marker  │      │             │
//!                         └──────────────┘      └───────────────┘      └──────┬──────┘
//!                                                                             │
//!                         ┌──────────────┐      ┌───────────────┐             │
//!                         │  Identities  │◄─────│ Reconciliation│◄────────────┘
//!                         │  & Accounts  │      │    Engine     │  (search, pushed changes)
//!                         └──────────────┘      └───────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use idsync_provisioning::{Engine, EngineConfig, EngineStores, SystemClock};
//!
//! let clock = Arc::new(SystemClock);
//! let engine = Engine::new(
//!     EngineConfig::from_env()?,
//!     EngineStores::in_memory(clock.clone()),
//!     connectors,
//!     clock,
//! );
//! let worker = engine.spawn_worker();
//!
//! engine.put_mapping(mapping)?;
//! engine.enqueue(account, OperationKind::Update, attributes).await?;
//! ```

pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod echo;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod mapping;
pub mod queue;
pub mod sync;
pub mod worker;

// Re-exports for convenience
pub use breaker::{Admission, BreakerConfig, BreakerSnapshot, ProvisioningBreaker};
pub use cache::{CacheError, CacheUpdate, DistributedCache, InMemoryDistributedCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, ScriptConfig};
pub use echo::{EchoAspect, EchoConfig, EchoSuppressor};
pub use engine::{Engine, EngineStores, WorkerHandle};
pub use error::{ProvisioningError, ProvisioningResult};
pub use events::{IdentityEvent, ProvisioningEventHandler};
pub use identity::{
    Account, AccountRef, AccountState, FlaggedObject, Identity, IdentityStore,
    InMemoryIdentityStore,
};
pub use mapping::{AttributeMapper, InboundValue, MappedAttributes, MappingRepository, ValueCacheConfig};
pub use queue::{
    BatchDispatcher, BatchStatus, BatchStore, ConfidentialStore, DispatchOutcome, Enqueued,
    InMemoryBatchStore, InMemoryConfidentialStore, OperationOutcome, OperationRecord,
    ProvisioningBatch, ProvisioningOperation, ProvisioningService, QueueConfig, QueueContext,
    RetrySweeper, SweepHandle, SweepReport,
};
pub use sync::{
    InMemorySyncConfigStore, MissingStrategy, ReconciliationMode, RunHandle, RunState,
    RunStatistics, RunStatus, SyncConfigStore, SyncConfiguration, SyncContext, SyncEngine,
    SyncError, SyncResult, UnmatchedStrategy,
};
pub use worker::{ProvisioningWorker, WorkerConfig};
