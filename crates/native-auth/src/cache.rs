//! Generic expiring key/value cache with optional blob persistence
//!
//! Entries carry an absolute expiry (unix milliseconds). An expired entry is
//! reported absent on read and left for [`ExpiringCache::clean`] to evict; its
//! expiry is never extended implicitly.
//!
//! With a [`BlobStore`] attached, each entry is also written as a JSON blob
//! `{key, expires, value}`. Writes hit the store before memory, and a memory
//! miss consults the store before reporting absent, so both paths converge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::BlobStore;
use crate::{metrics, now_millis};

/// A cached value with its key and absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedItem<V> {
    pub key: String,
    /// Expiry as unix timestamp in milliseconds; `None` never expires
    pub expires: Option<u64>,
    pub value: V,
}

impl<V> CachedItem<V> {
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        matches!(self.expires, Some(expires) if expires <= now_millis)
    }
}

/// Thread-safe expiring cache.
///
/// All operations take the item lock, so reads and writes are linearizable
/// per key. Persistence I/O happens under that lock.
pub struct ExpiringCache<V> {
    items: Mutex<HashMap<String, CachedItem<V>>>,
    default_key: Option<String>,
    store: Option<Arc<dyn BlobStore>>,
    namespace: String,
    sweep: Mutex<()>,
}

impl<V> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            default_key: None,
            store: None,
            namespace: String::new(),
            sweep: Mutex::new(()),
        }
    }
}

impl<V> ExpiringCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// In-memory cache with no default key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Key used when a caller passes an empty key (single-tenant use).
    pub fn with_default_key(mut self, key: impl Into<String>) -> Self {
        self.default_key = Some(key.into());
        self
    }

    /// Persist entries through `store`. Blob names are `{namespace}/{key}`
    /// so several caches can share one store.
    pub fn with_store(mut self, store: Arc<dyn BlobStore>, namespace: impl Into<String>) -> Self {
        self.store = Some(store);
        self.namespace = namespace.into();
        self
    }

    pub fn default_key(&self) -> Option<&str> {
        self.default_key.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// Add a value.
    ///
    /// Fails with [`Error::Conflict`] when `replace` is false and an unexpired
    /// entry already exists for the key.
    pub async fn add(
        &self,
        key: &str,
        value: V,
        replace: bool,
        expires: Option<u64>,
    ) -> Result<()> {
        let key = self.resolve_key(key)?;
        let mut items = self.items.lock().await;

        if !replace && self.lookup(&mut items, &key, now_millis()).await.is_some() {
            return Err(Error::Conflict(key));
        }

        let item = CachedItem {
            key: key.clone(),
            expires,
            value,
        };
        if let Some(store) = &self.store {
            let blob = serde_json::to_vec(&item)
                .map_err(|e| Error::Storage(format!("serializing cache entry: {e}")))?;
            store.set(&self.blob_name(&key), blob).await?;
        }
        items.insert(key.clone(), item);
        debug!(key = %key, expires, "cached entry");
        Ok(())
    }

    /// Look up an unexpired value.
    pub async fn try_get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.get_item(key).await?.map(|item| item.value))
    }

    /// Look up an unexpired entry including its expiry.
    pub async fn get_item(&self, key: &str) -> Result<Option<CachedItem<V>>> {
        let key = self.resolve_key(key)?;
        let mut items = self.items.lock().await;
        let found = self.lookup(&mut items, &key, now_millis()).await;
        metrics::record_cache_lookup(found.is_some());
        Ok(found)
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        let key = self.resolve_key(key)?;
        let mut items = self.items.lock().await;
        Ok(self.lookup(&mut items, &key, now_millis()).await.is_some())
    }

    /// Remove an entry from memory and the store.
    ///
    /// Returns whether an entry was present in memory.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let key = self.resolve_key(key)?;
        let mut items = self.items.lock().await;
        if let Some(store) = &self.store {
            store.delete(&self.blob_name(&key)).await?;
        }
        let removed = items.remove(&key).is_some();
        debug!(key = %key, removed, "removed cache entry");
        Ok(removed)
    }

    /// Evict every expired entry. Returns the number evicted.
    ///
    /// Concurrent calls coalesce: a call that finds a sweep already running
    /// waits for it to finish and returns 0 instead of sweeping again.
    pub async fn clean(&self) -> usize {
        let _sweep = match self.sweep.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _wait = self.sweep.lock().await;
                return 0;
            }
        };

        let now = now_millis();
        let mut items = self.items.lock().await;
        let expired: Vec<String> = items
            .values()
            .filter(|item| item.is_expired_at(now))
            .map(|item| item.key.clone())
            .collect();

        for key in &expired {
            if let Some(store) = &self.store
                && let Err(e) = store.delete(&self.blob_name(key)).await
            {
                warn!(key = %key, error = %e, "failed to delete expired blob");
            }
            items.remove(key);
        }

        if !expired.is_empty() {
            debug!(evicted = expired.len(), "cache sweep evicted expired entries");
        }
        expired.len()
    }

    /// Entries held in memory, expired ones included.
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The key an operation on `key` addresses: `key` itself, or the default
    /// key when `key` is blank.
    pub fn resolve_key(&self, key: &str) -> Result<String> {
        if !key.trim().is_empty() {
            return Ok(key.to_string());
        }
        self.default_key
            .clone()
            .ok_or_else(|| Error::InvalidKey("cache key cannot be empty".into()))
    }

    fn blob_name(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.namespace)
        }
    }

    /// Find an unexpired entry, falling back to the store on a memory miss.
    /// Store failures degrade to a miss.
    async fn lookup(
        &self,
        items: &mut HashMap<String, CachedItem<V>>,
        key: &str,
        now: u64,
    ) -> Option<CachedItem<V>> {
        if let Some(item) = items.get(key) {
            return (!item.is_expired_at(now)).then(|| item.clone());
        }

        let store = self.store.as_ref()?;
        let name = self.blob_name(key);
        let blob = match store.get(&name).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to load persisted cache entry");
                return None;
            }
        };

        let item: CachedItem<V> = match serde_json::from_slice(&blob) {
            Ok(item) => item,
            Err(e) => {
                warn!(key = %key, error = %e, "discarding unreadable persisted cache entry");
                if let Err(e) = store.delete(&name).await {
                    warn!(key = %key, error = %e, "failed to delete unreadable blob");
                }
                return None;
            }
        };

        if item.is_expired_at(now) {
            debug!(key = %key, "persisted entry expired, deleting");
            if let Err(e) = store.delete(&name).await {
                warn!(key = %key, error = %e, "failed to delete expired blob");
            }
            return None;
        }

        debug!(key = %key, "loaded cache entry from store");
        items.insert(key.to_string(), item.clone());
        Some(item)
    }
}

/// Spawn a background task that sweeps expired entries every `interval`.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_clean_task<V>(
    cache: Arc<ExpiringCache<V>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            cache.clean().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use crate::storage::MemoryBlobStore;

    const HOUR: u64 = 3_600_000;

    fn later() -> Option<u64> {
        Some(now_millis() + HOUR)
    }

    fn earlier() -> Option<u64> {
        Some(now_millis() - 1_000)
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    impl BlobStore for BrokenStore {
        fn get<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
            Box::pin(async { Err(Error::Storage("disk on fire".into())) })
        }
        fn set<'a>(&'a self, _name: &'a str, _blob: Vec<u8>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Err(Error::Storage("disk on fire".into())) })
        }
        fn delete<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Err(Error::Storage("disk on fire".into())) })
        }
    }

    #[tokio::test]
    async fn add_then_get_returns_value_unchanged() {
        let cache = ExpiringCache::new();
        cache.add("k", "value".to_string(), false, later()).await.unwrap();
        assert_eq!(cache.try_get("k").await.unwrap().as_deref(), Some("value"));
        assert!(cache.contains("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entry_is_absent() {
        let cache = ExpiringCache::new();
        cache.add("k", 1u32, false, earlier()).await.unwrap();
        assert_eq!(cache.try_get("k").await.unwrap(), None);
        assert!(!cache.contains("k").await.unwrap());
        // Still held until swept
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn entry_without_expiry_never_expires() {
        let cache = ExpiringCache::new();
        cache.add("k", 1u32, false, None).await.unwrap();
        assert_eq!(cache.try_get("k").await.unwrap(), Some(1));
        assert_eq!(cache.clean().await, 0);
    }

    #[tokio::test]
    async fn add_without_replace_conflicts() {
        let cache = ExpiringCache::new();
        cache.add("k", 1u32, false, later()).await.unwrap();
        let err = cache.add("k", 2u32, false, later()).await.unwrap_err();
        assert_eq!(err, Error::Conflict("k".into()));
        assert_eq!(cache.try_get("k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn add_with_replace_overwrites() {
        let cache = ExpiringCache::new();
        cache.add("k", 1u32, false, later()).await.unwrap();
        cache.add("k", 2u32, true, later()).await.unwrap();
        assert_eq!(cache.try_get("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn expired_entry_does_not_conflict() {
        let cache = ExpiringCache::new();
        cache.add("k", 1u32, false, earlier()).await.unwrap();
        cache.add("k", 2u32, false, later()).await.unwrap();
        assert_eq!(cache.try_get("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn empty_key_rejected_without_default() {
        let cache = ExpiringCache::<u32>::new();
        let err = cache.add("  ", 1, false, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        assert!(matches!(
            cache.try_get("").await.unwrap_err(),
            Error::InvalidKey(_)
        ));
    }

    #[tokio::test]
    async fn empty_key_uses_default_key() {
        let cache = ExpiringCache::new().with_default_key("only");
        cache.add("", 7u32, false, None).await.unwrap();
        assert_eq!(cache.try_get("only").await.unwrap(), Some(7));
        assert_eq!(cache.try_get("").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let cache = ExpiringCache::new();
        cache.add("k", 1u32, false, later()).await.unwrap();
        assert!(cache.remove("k").await.unwrap());
        assert!(!cache.remove("k").await.unwrap());
        assert_eq!(cache.try_get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clean_evicts_only_expired() {
        let cache = ExpiringCache::new();
        cache.add("old-1", 1u32, false, earlier()).await.unwrap();
        cache.add("old-2", 2u32, false, earlier()).await.unwrap();
        cache.add("fresh", 3u32, false, later()).await.unwrap();

        assert_eq!(cache.clean().await, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.try_get("fresh").await.unwrap(), Some(3));
        assert_eq!(cache.clean().await, 0);
    }

    #[tokio::test]
    async fn concurrent_cleans_coalesce() {
        let cache = Arc::new(ExpiringCache::new());
        for i in 0..20 {
            cache
                .add(&format!("k{i}"), i as u32, false, earlier())
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.clean().await })
            })
            .collect();

        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 20, "every entry is evicted exactly once");
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn persisted_entry_survives_new_instance() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());

        let cache = ExpiringCache::new().with_store(store.clone(), "tokens");
        cache.add("k", "v".to_string(), false, later()).await.unwrap();

        let reloaded = ExpiringCache::<String>::new().with_store(store.clone(), "tokens");
        assert_eq!(reloaded.try_get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.get("tokens/k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn persisted_blob_is_key_expires_value_json() {
        let store = Arc::new(MemoryBlobStore::new());
        let cache = ExpiringCache::new().with_store(store.clone(), "");
        cache.add("k", 5u32, false, Some(42)).await.unwrap();

        let blob = store.get("k").await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(json["key"], "k");
        assert_eq!(json["expires"], 42);
        assert_eq!(json["value"], 5);
    }

    #[tokio::test]
    async fn expired_persisted_entry_is_deleted_on_load() {
        let store = Arc::new(MemoryBlobStore::new());
        let cache = ExpiringCache::new().with_store(store.clone(), "ns");
        cache.add("k", 1u32, false, earlier()).await.unwrap();

        let reloaded = ExpiringCache::<u32>::new().with_store(store.clone(), "ns");
        assert_eq!(reloaded.try_get("k").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn persisted_entry_conflicts_after_reload() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        ExpiringCache::new()
            .with_store(store.clone(), "ns")
            .add("k", 1u32, false, later())
            .await
            .unwrap();

        let reloaded = ExpiringCache::<u32>::new().with_store(store, "ns");
        let err = reloaded.add("k", 2, false, later()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn remove_deletes_blob() {
        let store = Arc::new(MemoryBlobStore::new());
        let cache = ExpiringCache::new().with_store(store.clone(), "ns");
        cache.add("k", 1u32, false, later()).await.unwrap();
        cache.remove("k").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_persist_leaves_memory_untouched() {
        let cache = ExpiringCache::new().with_store(Arc::new(BrokenStore), "ns");
        let err = cache.add("k", 1u32, false, later()).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn unreadable_store_degrades_to_miss() {
        let cache = ExpiringCache::<u32>::new().with_store(Arc::new(BrokenStore), "ns");
        assert_eq!(cache.try_get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_task_sweeps_periodically() {
        let cache = Arc::new(ExpiringCache::new());
        cache.add("old", 1u32, false, earlier()).await.unwrap();

        let handle = spawn_clean_task(cache.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(cache.is_empty().await);
        handle.abort();
    }
}
