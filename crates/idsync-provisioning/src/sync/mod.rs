//! Reconciliation Module
//!
//! Converges a target system and the identity repository after drift:
//! outages, manual edits on the target, or missed events.
//!
//! ## Key Components
//!
//! - [`SyncEngine`] - Starts, tracks and cancels reconciliation runs
//! - [`SyncConfiguration`] - Per (system, object class) mode and strategies
//! - [`RunHandle`] - Status, statistics, cancellation and completion of a run
//!
//! ## Reconciliation Flow
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Paged Search   │────►│  Diff per Item  │────►│ Account Update  │
//! │  (target)       │     │                 │     │                 │
//! └─────────────────┘     └────────┬────────┘     └─────────────────┘
//!                                  │
//!         ┌────────────────────────┼────────────────────────┐
//!         ▼                        ▼                        ▼
//! ┌───────────────┐      ┌─────────────────┐      ┌─────────────────┐
//! │  Correlation  │      │ Echo Filter and │      │ Outbound Restore│
//! │  (unmatched)  │      │ Inbound Mapping │      │ (queued update) │
//! └───────────────┘      └─────────────────┘      └─────────────────┘
//! ```
//!
//! After the last page, accounts whose object was not seen are handed to the
//! configuration's missing strategy.

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod run;

pub use config::{
    Correlation, InMemorySyncConfigStore, MissingStrategy, ReconciliationMode, SyncConfigStore,
    SyncConfiguration, UnmatchedStrategy,
};
pub use engine::{SyncContext, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use registry::ExecutorRegistry;
pub use run::{RunHandle, RunState, RunStatistics, RunStatus};
