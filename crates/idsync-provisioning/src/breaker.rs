//! Provisioning break (circuit breaker).
//!
//! One breaker per (system, operation kind), shared by every engine instance
//! through the [`DistributedCache`]. State machine:
//!
//! - Closed -> Closed: failure below the block threshold (warning logged once
//!   the warning threshold is crossed)
//! - Closed -> Open: failure count reaches the block threshold
//! - Open -> HalfOpen: `blocked_until` elapses; one probe is leased
//! - HalfOpen -> Closed: probe succeeds, counters reset
//! - HalfOpen -> Open: probe fails, backoff grows (capped)
//!
//! While open, operations are withheld with `ProvisioningBlocked` and are not
//! counted as failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use idsync_connector::ids::SystemId;
use idsync_connector::resilience::BackoffPolicy;
use idsync_connector::types::{CircuitState, OperationKind};

use crate::cache::{read_json, update_json, CacheUpdate, DistributedCache};
use crate::clock::{to_chrono, Clock};
use crate::error::ProvisioningResult;

/// Breaker thresholds and backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures at which a warning is emitted.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,

    /// Consecutive failures at which the breaker opens.
    #[serde(default = "default_block_threshold")]
    pub block_threshold: u32,

    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// How long a leased probe keeps other callers out of a half-open breaker.
    #[serde(default = "default_probe_lease_secs")]
    pub probe_lease_secs: u64,
}

fn default_warning_threshold() -> u32 {
    3
}

fn default_block_threshold() -> u32 {
    5
}

fn default_initial_backoff_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    3600
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_probe_lease_secs() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            block_threshold: default_block_threshold(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            probe_lease_secs: default_probe_lease_secs(),
        }
    }
}

impl BreakerConfig {
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.initial_backoff_secs),
            max: Duration::from_secs(self.max_backoff_secs),
            multiplier: self.backoff_multiplier,
        }
    }

    #[must_use]
    pub fn probe_lease(&self) -> Duration {
        Duration::from_secs(self.probe_lease_secs)
    }

    /// Longest block window plus a probe lease.
    fn base_ttl(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.saturating_add(self.probe_lease_secs))
    }

    /// Entries outlive the rest of their own block window plus the base TTL.
    fn state_ttl(&self, state: &ProvisioningBreakState, now: DateTime<Utc>) -> Duration {
        let remaining = state
            .blocked_until
            .and_then(|until| (until - now).to_std().ok())
            .unwrap_or_default();
        remaining + self.base_ttl()
    }

    fn put(
        &self,
        state: ProvisioningBreakState,
        now: DateTime<Utc>,
    ) -> CacheUpdate<ProvisioningBreakState> {
        let ttl = self.state_ttl(&state, now);
        CacheUpdate::PutFor(state, ttl)
    }
}

/// Shared breaker counters for one (system, kind).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningBreakState {
    pub consecutive_failures: u32,
    pub blocked_until: Option<DateTime<Utc>>,
    pub warning_emitted: bool,
    /// Times re-opened since the last close; drives the backoff exponent.
    pub open_count: u32,
    /// Lease held by the in-flight half-open probe.
    pub probe_until: Option<DateTime<Utc>>,
}

impl ProvisioningBreakState {
    fn circuit_state(&self, now: DateTime<Utc>) -> CircuitState {
        match self.blocked_until {
            None => CircuitState::Closed,
            Some(until) if now < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }
}

/// Outcome of the breaker gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed; go ahead.
    Allowed,
    /// Half-open; this caller holds the single probe lease.
    Probe,
    /// Open (or another probe is in flight); do not call the connector.
    Blocked { until: DateTime<Utc> },
}

/// Diagnostic view of one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub system: SystemId,
    pub kind: OperationKind,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Transition {
    None,
    Warning(u32),
    Opened(DateTime<Utc>),
    Reopened(DateTime<Utc>, u32),
    Closed,
}

/// Circuit breaker over (system, operation kind) backed by the shared cache.
#[derive(Clone)]
pub struct ProvisioningBreaker {
    cache: Arc<dyn DistributedCache>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
}

impl ProvisioningBreaker {
    pub fn new(cache: Arc<dyn DistributedCache>, clock: Arc<dyn Clock>, config: BreakerConfig) -> Self {
        Self {
            cache,
            clock,
            config,
        }
    }

    fn key(system: &SystemId, kind: OperationKind) -> String {
        format!("provisioning-break:{system}:{kind}")
    }

    /// Gate an operation. Taking the probe lease is atomic across instances.
    pub async fn admit(
        &self,
        system: &SystemId,
        kind: OperationKind,
    ) -> ProvisioningResult<Admission> {
        let now = self.clock.now();
        let lease = to_chrono(self.config.probe_lease());

        let admission = update_json::<ProvisioningBreakState, _, _>(
            self.cache.as_ref(),
            &Self::key(system, kind),
            self.config.base_ttl(),
            |current| {
                let Some(state) = current else {
                    return (CacheUpdate::Keep, Admission::Allowed);
                };
                match state.circuit_state(now) {
                    CircuitState::Closed => (CacheUpdate::Keep, Admission::Allowed),
                    CircuitState::Open => (
                        CacheUpdate::Keep,
                        Admission::Blocked {
                            until: state.blocked_until.unwrap_or(now),
                        },
                    ),
                    CircuitState::HalfOpen => match state.probe_until {
                        Some(until) if now < until => {
                            (CacheUpdate::Keep, Admission::Blocked { until })
                        }
                        _ => {
                            let mut next = state.clone();
                            next.probe_until = Some(now + lease);
                            (self.config.put(next, now), Admission::Probe)
                        }
                    },
                }
            },
        )
        .await?;

        if admission == Admission::Probe {
            info!(system = %system, kind = %kind, "Provisioning break half-open, sending probe");
        }
        Ok(admission)
    }

    /// Record a successful connector call; closes the breaker.
    pub async fn record_success(
        &self,
        system: &SystemId,
        kind: OperationKind,
    ) -> ProvisioningResult<()> {
        let transition = update_json::<ProvisioningBreakState, _, _>(
            self.cache.as_ref(),
            &Self::key(system, kind),
            self.config.base_ttl(),
            |current| match current {
                Some(state) if state.blocked_until.is_some() => {
                    (CacheUpdate::Remove, Transition::Closed)
                }
                Some(_) => (CacheUpdate::Remove, Transition::None),
                None => (CacheUpdate::Keep, Transition::None),
            },
        )
        .await?;

        if transition == Transition::Closed {
            info!(system = %system, kind = %kind, "Provisioning break closed after successful probe");
        }
        Ok(())
    }

    /// Record a transient connector failure.
    pub async fn record_failure(
        &self,
        system: &SystemId,
        kind: OperationKind,
    ) -> ProvisioningResult<()> {
        let now = self.clock.now();
        let config = &self.config;
        let backoff = config.backoff();

        let transition = update_json::<ProvisioningBreakState, _, _>(
            self.cache.as_ref(),
            &Self::key(system, kind),
            config.base_ttl(),
            |current| {
                let mut state = current.cloned().unwrap_or_default();
                match state.circuit_state(now) {
                    // Straggler from before the breaker opened.
                    CircuitState::Open => (CacheUpdate::Keep, Transition::None),
                    CircuitState::HalfOpen => {
                        state.open_count = state.open_count.saturating_add(1);
                        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                        let until = now + to_chrono(backoff.delay_for(state.open_count));
                        state.blocked_until = Some(until);
                        state.probe_until = None;
                        let open_count = state.open_count;
                        (config.put(state, now), Transition::Reopened(until, open_count))
                    }
                    CircuitState::Closed => {
                        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                        let failures = state.consecutive_failures;
                        if failures >= config.block_threshold {
                            let until = now + to_chrono(backoff.delay_for(0));
                            state.blocked_until = Some(until);
                            state.open_count = 0;
                            (config.put(state, now), Transition::Opened(until))
                        } else if failures >= config.warning_threshold && !state.warning_emitted {
                            state.warning_emitted = true;
                            (config.put(state, now), Transition::Warning(failures))
                        } else {
                            (config.put(state, now), Transition::None)
                        }
                    }
                }
            },
        )
        .await?;

        match transition {
            Transition::Warning(failures) => warn!(
                system = %system,
                kind = %kind,
                consecutive_failures = failures,
                block_threshold = config.block_threshold,
                "Provisioning failures crossed warning threshold"
            ),
            Transition::Opened(until) => error!(
                system = %system,
                kind = %kind,
                blocked_until = %until,
                "Provisioning break opened"
            ),
            Transition::Reopened(until, open_count) => error!(
                system = %system,
                kind = %kind,
                blocked_until = %until,
                open_count,
                "Provisioning break probe failed, re-opened"
            ),
            Transition::None | Transition::Closed => {
                debug!(system = %system, kind = %kind, "Provisioning failure recorded");
            }
        }
        Ok(())
    }

    /// Current breaker state for diagnostics.
    pub async fn snapshot(
        &self,
        system: &SystemId,
        kind: OperationKind,
    ) -> ProvisioningResult<BreakerSnapshot> {
        let now = self.clock.now();
        let state = read_json::<ProvisioningBreakState>(self.cache.as_ref(), &Self::key(system, kind))
            .await?
            .map(|(state, _)| state)
            .unwrap_or_default();

        Ok(BreakerSnapshot {
            system: system.clone(),
            kind,
            state: state.circuit_state(now),
            consecutive_failures: state.consecutive_failures,
            blocked_until: state.blocked_until,
        })
    }

    /// Current circuit state.
    pub async fn state(&self, system: &SystemId, kind: OperationKind) -> ProvisioningResult<CircuitState> {
        Ok(self.snapshot(system, kind).await?.state)
    }
}
