//! Distributed cache contract.
//!
//! Breaker state and echo markers must be consistent across engine
//! instances. They live in a key/value store with TTL and versioned
//! compare-and-swap, so concurrent read-modify-write cycles never lose an
//! update.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use chrono::{DateTime, Utc};

use crate::clock::{to_chrono, Clock};

/// Attempts before a contended read-modify-write gives up.
pub const MAX_CAS_ATTEMPTS: u32 = 16;

/// Error returned by a cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry '{key}' is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("update of cache entry '{key}' still conflicting after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
}

/// A cached value and the version it was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// Key/value store shared by all engine instances.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Read a live (unexpired) entry.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, CacheError>;

    /// Store `value` only if the entry is still at `expected` (`None` meaning
    /// absent). Returns the new version, or `None` when another writer won.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<Option<u64>, CacheError>;

    /// Remove the entry only if it is still at `version`.
    async fn remove_if(&self, key: &str, version: u64) -> Result<bool, CacheError>;
}

/// Read and decode a JSON entry.
pub async fn read_json<T: DeserializeOwned>(
    cache: &dyn DistributedCache,
    key: &str,
) -> Result<Option<(T, u64)>, CacheError> {
    match cache.get(key).await? {
        Some(entry) => {
            let value = serde_json::from_str(&entry.value).map_err(|source| CacheError::Corrupt {
                key: key.to_string(),
                source,
            })?;
            Ok(Some((value, entry.version)))
        }
        None => Ok(None),
    }
}

/// What an [`update_json`] step does with the entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate<T> {
    /// Leave the entry as it is.
    Keep,
    /// Store a new value.
    Put(T),
    /// Store a new value with its own time to live.
    PutFor(T, Duration),
    /// Delete the entry.
    Remove,
}

/// Atomically update a JSON entry.
///
/// `update` sees the current value and decides what to do with it, along
/// with a result handed back to the caller. It is re-run from a fresh read
/// whenever a concurrent writer wins. `ttl` applies to `Put`.
pub async fn update_json<T, R, F>(
    cache: &dyn DistributedCache,
    key: &str,
    ttl: Duration,
    mut update: F,
) -> Result<R, CacheError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<&T>) -> (CacheUpdate<T>, R),
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = read_json::<T>(cache, key).await?;
        let (next, result) = update(current.as_ref().map(|(value, _)| value));
        let expected = current.as_ref().map(|(_, version)| *version);

        let written = match (next, expected) {
            (CacheUpdate::Keep, _) | (CacheUpdate::Remove, None) => return Ok(result),
            (CacheUpdate::Remove, Some(version)) => cache.remove_if(key, version).await?,
            (CacheUpdate::Put(value), expected) => {
                put_encoded(cache, key, expected, &value, ttl).await?
            }
            (CacheUpdate::PutFor(value, ttl), expected) => {
                put_encoded(cache, key, expected, &value, ttl).await?
            }
        };
        if written {
            return Ok(result);
        }
        debug!(key, attempt, "Cache update lost a race, retrying");
    }
    Err(CacheError::Contention {
        key: key.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    })
}

async fn put_encoded<T: Serialize>(
    cache: &dyn DistributedCache,
    key: &str,
    expected: Option<u64>,
    value: &T,
    ttl: Duration,
) -> Result<bool, CacheError> {
    let encoded = serde_json::to_string(value).map_err(|source| CacheError::Corrupt {
        key: key.to_string(),
        source,
    })?;
    Ok(cache
        .compare_and_swap(key, expected, encoded, ttl)
        .await?
        .is_some())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    version: u64,
    expires_at: DateTime<Utc>,
}

/// Single-process [`DistributedCache`], for tests and single-node deployments.
#[derive(Debug)]
pub struct InMemoryDistributedCache {
    entries: DashMap<String, CacheEntry>,
    next_version: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InMemoryDistributedCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            next_version: AtomicU64::new(1),
            clock,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, CacheError> {
        let now = self.clock.now();
        let live = self.entries.get(key).and_then(|entry| {
            (entry.expires_at > now).then(|| Versioned {
                value: entry.value.clone(),
                version: entry.version,
            })
        });
        if live.is_none() {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(live)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<Option<u64>, CacheError> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(ttl);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let current_version = (current.expires_at > now).then_some(current.version);
                if current_version != expected {
                    return Ok(None);
                }
                let version = self.bump();
                occupied.insert(CacheEntry {
                    value,
                    version,
                    expires_at,
                });
                Ok(Some(version))
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(None);
                }
                let version = self.bump();
                vacant.insert(CacheEntry {
                    value,
                    version,
                    expires_at,
                });
                Ok(Some(version))
            }
        }
    }

    async fn remove_if(&self, key: &str, version: u64) -> Result<bool, CacheError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| {
                entry.version == version && entry.expires_at > now
            })
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde::Deserialize;

    fn cache() -> (Arc<ManualClock>, InMemoryDistributedCache) {
        let clock = Arc::new(ManualClock::default());
        let cache = InMemoryDistributedCache::new(clock.clone());
        (clock, cache)
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let (_, cache) = cache();
        let ttl = Duration::from_secs(60);

        let v1 = cache
            .compare_and_swap("k", None, "a".into(), ttl)
            .await
            .unwrap()
            .unwrap();
        assert!(cache
            .compare_and_swap("k", None, "b".into(), ttl)
            .await
            .unwrap()
            .is_none());

        let v2 = cache
            .compare_and_swap("k", Some(v1), "b".into(), ttl)
            .await
            .unwrap()
            .unwrap();
        assert!(v2 > v1);
        assert!(cache
            .compare_and_swap("k", Some(v1), "c".into(), ttl)
            .await
            .unwrap()
            .is_none());
        assert_eq!(cache.get("k").await.unwrap().unwrap().value, "b");
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (clock, cache) = cache();
        cache
            .compare_and_swap("k", None, "a".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(11));
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());

        // An expired entry counts as absent for CAS.
        assert!(cache
            .compare_and_swap("k", None, "b".into(), Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_remove_if_only_once() {
        let (_, cache) = cache();
        let version = cache
            .compare_and_swap("k", None, "a".into(), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(cache.remove_if("k", version).await.unwrap());
        assert!(!cache.remove_if("k", version).await.unwrap());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        n: u32,
    }

    #[tokio::test]
    async fn test_update_json_concurrent_increments_are_not_lost() {
        let (_, cache) = cache();
        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                update_json::<Counter, (), _>(
                    cache.as_ref(),
                    "counter",
                    Duration::from_secs(60),
                    |current| {
                        let n = current.map_or(0, |c| c.n);
                        (CacheUpdate::Put(Counter { n: n + 1 }), ())
                    },
                )
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let (counter, _) = read_json::<Counter>(cache.as_ref(), "counter")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter, Counter { n: 8 });
    }
}
