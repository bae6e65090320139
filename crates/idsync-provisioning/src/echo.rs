//! Echo suppression.
//!
//! Before pushing a change the target is known to reflect back, the engine
//! leaves a short-lived marker keyed by (system, UID, aspect). An inbound
//! change that finds a live marker consumes it and is discarded as
//! self-originated. Markers live in the [`DistributedCache`] because the push
//! and the echo may be observed by different instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use idsync_connector::ids::SystemId;
use idsync_connector::operation::Uid;

use crate::cache::{read_json, update_json, CacheUpdate, DistributedCache};
use crate::clock::Clock;
use crate::error::ProvisioningResult;

/// Echo marker lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "default_marker_ttl_secs")]
    pub marker_ttl_secs: u64,
}

fn default_marker_ttl_secs() -> u64 {
    2 * 60 * 60
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            marker_ttl_secs: default_marker_ttl_secs(),
        }
    }
}

impl EchoConfig {
    #[must_use]
    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_secs)
    }
}

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EchoAspect {
    Password,
    Attribute(String),
}

impl fmt::Display for EchoAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EchoAspect::Password => write!(f, "password"),
            EchoAspect::Attribute(name) => write!(f, "attr:{name}"),
        }
    }
}

/// Stored marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoMarker {
    /// SHA-256 of the pushed value, when the echo is expected to carry it.
    pub digest: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Hex SHA-256 of a value.
#[must_use]
pub fn value_digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Marker store over the shared cache.
#[derive(Clone)]
pub struct EchoSuppressor {
    cache: Arc<dyn DistributedCache>,
    clock: Arc<dyn Clock>,
    config: EchoConfig,
}

impl EchoSuppressor {
    pub fn new(cache: Arc<dyn DistributedCache>, clock: Arc<dyn Clock>, config: EchoConfig) -> Self {
        Self {
            cache,
            clock,
            config,
        }
    }

    fn key(system: &SystemId, uid: &Uid, aspect: &EchoAspect) -> String {
        format!("echo:{system}:{uid}:{aspect}")
    }

    /// Record that we are about to push `aspect` to the target.
    ///
    /// Pass the pushed value to only suppress an echo carrying that same
    /// value; `None` suppresses any echo of the aspect.
    #[instrument(skip(self, value), fields(system = %system, uid = %uid, aspect = %aspect))]
    pub async fn mark(
        &self,
        system: &SystemId,
        uid: &Uid,
        aspect: &EchoAspect,
        value: Option<&str>,
    ) -> ProvisioningResult<()> {
        let marker = EchoMarker {
            digest: value.map(value_digest),
            created_at: self.clock.now(),
        };
        update_json::<EchoMarker, _, _>(
            self.cache.as_ref(),
            &Self::key(system, uid, aspect),
            self.config.marker_ttl(),
            |_| (CacheUpdate::Put(marker.clone()), ()),
        )
        .await?;
        debug!("Echo marker written");
        Ok(())
    }

    /// Check an inbound change against a marker and consume it.
    ///
    /// Returns `true` exactly once per marker, to the caller that should
    /// discard the change. A change carrying a different value than the one
    /// pushed is independent and leaves the marker in place.
    #[instrument(skip(self, observed), fields(system = %system, uid = %uid, aspect = %aspect))]
    pub async fn consume(
        &self,
        system: &SystemId,
        uid: &Uid,
        aspect: &EchoAspect,
        observed: Option<&str>,
    ) -> ProvisioningResult<bool> {
        let observed_digest = observed.map(value_digest);
        let consumed = update_json::<EchoMarker, _, _>(
            self.cache.as_ref(),
            &Self::key(system, uid, aspect),
            self.config.marker_ttl(),
            |current| match current {
                None => (CacheUpdate::Keep, false),
                Some(marker) => match (&marker.digest, &observed_digest) {
                    (Some(expected), Some(seen)) if expected != seen => (CacheUpdate::Keep, false),
                    _ => (CacheUpdate::Remove, true),
                },
            },
        )
        .await?;

        if consumed {
            debug!("Echo suppressed");
        }
        Ok(consumed)
    }

    /// Whether a live marker exists (diagnostics).
    pub async fn exists(
        &self,
        system: &SystemId,
        uid: &Uid,
        aspect: &EchoAspect,
    ) -> ProvisioningResult<bool> {
        Ok(
            read_json::<EchoMarker>(self.cache.as_ref(), &Self::key(system, uid, aspect))
                .await?
                .is_some(),
        )
    }
}
