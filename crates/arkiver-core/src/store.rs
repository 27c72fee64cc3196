//! TTL-bounded memoization store handed to every handler invocation.
//!
//! Values are kept as `serde_json::Value` so one store can serve handlers
//! caching unrelated types. A `retrieve` for a key whose computation is
//! still running joins that computation instead of starting another one.

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ArkiverError;

/// Default maximum number of cached keys.
const DEFAULT_CAPACITY: usize = 10_000;

/// Configuration for the handler store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of keys; least recently used keys are evicted first.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// TTL applied when a call does not pass one. `None` = never expires.
    #[serde(default)]
    pub default_ttl_ms: Option<u64>,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_ttl_ms: None,
        }
    }
}

type Computation = Shared<BoxFuture<'static, Result<Value, String>>>;

/// Handler keys and pipeline keys live apart, so no handler key can shadow
/// a pipeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Handler(String),
    Pipeline(String),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(key) => f.write_str(key),
            Self::Pipeline(key) => write!(f, "<pipeline>{key}"),
        }
    }
}

#[derive(Clone)]
enum Slot {
    Ready(Value),
    InFlight { id: u64, computation: Computation },
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-wide memoization cache. Cheap to clone; clones share entries.
#[derive(Clone)]
pub struct Store {
    entries: Arc<Mutex<LruCache<CacheKey, Entry>>>,
    next_id: Arc<AtomicU64>,
    default_ttl: Option<Duration>,
}

impl Store {
    pub fn new(config: &StoreConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            next_id: Arc::new(AtomicU64::new(0)),
            default_ttl: config.default_ttl_ms.map(Duration::from_millis),
        }
    }

    /// Return the cached value for `key`, or compute, cache and return it.
    ///
    /// Concurrent callers for the same key share one computation. A failed
    /// computation is not cached.
    pub async fn retrieve<T, F, Fut>(
        &self,
        key: impl Into<String>,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<T, ArkiverError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ArkiverError>> + Send + 'static,
    {
        self.retrieve_keyed(CacheKey::Handler(key.into()), compute, ttl)
            .await
    }

    /// [`Store::retrieve`] in the pipeline's own key space.
    pub(crate) async fn retrieve_pipeline<T, F, Fut>(
        &self,
        key: impl Into<String>,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<T, ArkiverError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ArkiverError>> + Send + 'static,
    {
        self.retrieve_keyed(CacheKey::Pipeline(key.into()), compute, ttl)
            .await
    }

    pub(crate) fn remove_pipeline(&self, key: &str) {
        self.entries.lock().pop(&CacheKey::Pipeline(key.to_string()));
    }

    async fn retrieve_keyed<T, F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<T, ArkiverError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ArkiverError>> + Send + 'static,
    {
        let slot = match self.lookup(&key) {
            Some(slot) => slot,
            None => {
                let fut = compute();
                let computation: Computation = async move {
                    let value = fut.await.map_err(|e| e.to_string())?;
                    serde_json::to_value(value).map_err(|e| e.to_string())
                }
                .boxed()
                .shared();
                self.install(&key, computation, ttl)
            }
        };

        let (id, computation) = match slot {
            Slot::Ready(value) => return decode(&key, value),
            Slot::InFlight { id, computation } => (id, computation),
        };

        let outcome = computation.await;
        self.settle(&key, id, &outcome);
        match outcome {
            Ok(value) => decode(&key, value),
            Err(reason) => Err(ArkiverError::Store {
                key: key.to_string(),
                reason,
            }),
        }
    }

    /// Synchronous variant of [`Store::retrieve`].
    ///
    /// If an async computation for `key` is in flight it is left alone and
    /// `compute` runs uncached.
    pub fn retrieve_with<T, F>(
        &self,
        key: impl Into<String>,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<T, ArkiverError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let key = CacheKey::Handler(key.into());
        match self.lookup(&key) {
            Some(Slot::Ready(value)) => decode(&key, value),
            Some(Slot::InFlight { .. }) => Ok(compute()),
            None => {
                let value = compute();
                self.put(key, &value, ttl)?;
                Ok(value)
            }
        }
    }

    /// Write a value directly, replacing any cached or in-flight entry.
    pub fn set<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), ArkiverError> {
        self.put(CacheKey::Handler(key.into()), value, ttl)
    }

    fn put<T: Serialize>(&self, key: CacheKey, value: &T, ttl: Option<Duration>) -> Result<(), ArkiverError> {
        let value = serde_json::to_value(value).map_err(|e| ArkiverError::Store {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let expires_at = self.expiry(ttl);
        self.entries.lock().put(
            key,
            Entry {
                slot: Slot::Ready(value),
                expires_at,
            },
        );
        Ok(())
    }

    /// Read a ready, unexpired value without computing one.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.lookup(&CacheKey::Handler(key.to_string()))? {
            Slot::Ready(value) => serde_json::from_value(value).ok(),
            Slot::InFlight { .. } => None,
        }
    }

    /// Drop `key` from the cache.
    pub fn remove(&self, key: &str) {
        self.entries.lock().pop(&CacheKey::Handler(key.to_string()));
    }

    /// Number of cached keys, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<Instant> {
        ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl)
    }

    fn lookup(&self, key: &CacheKey) -> Option<Slot> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key).map(|entry| entry.is_live(now)) {
            Some(true) => entries.peek(key).map(|entry| entry.slot.clone()),
            Some(false) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Insert `computation` unless another caller won the race meanwhile,
    /// in which case the winner's slot is returned.
    fn install(&self, key: &CacheKey, computation: Computation, ttl: Option<Duration>) -> Slot {
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                return entry.slot.clone();
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Slot::InFlight { id, computation };
        entries.put(
            key.clone(),
            Entry {
                slot: slot.clone(),
                expires_at,
            },
        );
        slot
    }

    /// Promote a finished computation to a ready value, or evict it on error.
    fn settle(&self, key: &CacheKey, id: u64, outcome: &Result<Value, String>) {
        let mut entries = self.entries.lock();
        let current = matches!(
            entries.peek(key),
            Some(Entry { slot: Slot::InFlight { id: current, .. }, .. }) if *current == id
        );
        if !current {
            return;
        }
        match outcome {
            Ok(value) => {
                if let Some(entry) = entries.peek_mut(key) {
                    entry.slot = Slot::Ready(value.clone());
                }
            }
            Err(_) => {
                entries.pop(key);
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}

fn decode<T: DeserializeOwned>(key: &CacheKey, value: Value) -> Result<T, ArkiverError> {
    serde_json::from_value(value).map_err(|e| ArkiverError::Store {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
