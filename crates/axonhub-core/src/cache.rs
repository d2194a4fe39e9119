//! Live caches (C9).
//!
//! [`Cache`] holds one periodically refreshed value; [`IndexedCache`] is a
//! key→value cache with TTL, negative caching, per-key singleflight loads,
//! periodic incremental refresh via a `load_since` function, and an
//! optional watcher bus for invalidation events.
//!
//! Values handed out are clones; treating a cached value as shared mutable
//! state is a contract violation.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("key not found")]
    KeyNotFound,
    #[error("load failed: {0}")]
    Load(String),
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub refresh_interval: Duration,
    /// Short TTL for not-found entries, preventing penetration.
    pub negative_ttl: Duration,
    pub debounce_delay: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(5),
            debounce_delay: Duration::from_millis(500),
        }
    }
}

/// Watcher bus events, delivered best-effort: slow subscribers drop.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Refresh { updated_at: DateTime<Utc> },
    ForceRefresh,
    InvalidateKeys(Vec<K>),
    ReloadKeys(Vec<K>),
}

pub type LoadOneFn<K, V> =
    Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, CacheError>> + Send + Sync>;
pub type LoadSinceFn<V> = Arc<
    dyn Fn(Option<DateTime<Utc>>) -> BoxFuture<'static, Result<(Vec<V>, DateTime<Utc>), CacheError>>
        + Send
        + Sync,
>;
pub type KeyFn<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;
pub type DeletedFn<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

// ================================================================
// Single-value cache
// ================================================================

/// `(current, last_update) → (value, new_last_update, changed)`.
pub type RefreshFn<V> = Arc<
    dyn Fn(
            Option<V>,
            Option<DateTime<Utc>>,
        ) -> BoxFuture<'static, Result<(V, DateTime<Utc>, bool), CacheError>>
        + Send
        + Sync,
>;

struct CacheInner<V> {
    value: RwLock<Option<V>>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    refresh: RefreshFn<V>,
    reload: Notify,
    stop: watch::Sender<bool>,
    options: CacheOptions,
}

#[derive(Clone)]
pub struct Cache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    pub fn new(refresh: RefreshFn<V>, options: CacheOptions) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(CacheInner {
                value: RwLock::new(None),
                last_update: RwLock::new(None),
                refresh,
                reload: Notify::new(),
                stop,
                options,
            }),
        }
    }

    pub fn get(&self) -> Option<V> {
        self.inner
            .value
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Debounced async reload nudge.
    pub fn trigger_async_reload(&self) {
        self.inner.reload.notify_one();
    }

    pub fn stop(&self) {
        let _ = self.inner.stop.send(true);
    }

    pub async fn refresh_once(&self) -> Result<(), CacheError> {
        let current = self.get();
        let last = *self
            .inner
            .last_update
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let (value, new_last, changed) = (self.inner.refresh)(current, last).await?;
        if changed {
            *self.inner.value.write().unwrap_or_else(|e| e.into_inner()) = Some(value);
        }
        *self
            .inner
            .last_update
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(new_last);
        Ok(())
    }

    /// Spawn the periodic refresh loop. Stops on [`Cache::stop`].
    pub fn start(&self) {
        let cache = self.clone();
        let mut stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(cache.inner.options.refresh_interval) => {}
                    _ = cache.inner.reload.notified() => {
                        tokio::time::sleep(cache.inner.options.debounce_delay).await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                }
                if *stop.borrow() {
                    return;
                }
                if let Err(err) = cache.refresh_once().await {
                    tracing::warn!(error = %err, "cache refresh failed");
                }
            }
        });
    }
}

// ================================================================
// Indexed cache
// ================================================================

struct Entry<V> {
    /// `None` marks a negative entry.
    value: Option<V>,
    expires_at: Instant,
}

struct IndexedInner<K, V> {
    index: RwLock<HashMap<K, Entry<V>>>,
    inflight: Mutex<HashMap<K, Arc<Mutex<()>>>>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    load_one: LoadOneFn<K, V>,
    load_since: RwLock<Option<LoadSinceFn<V>>>,
    key_fn: RwLock<Option<KeyFn<K, V>>>,
    deleted_fn: RwLock<Option<DeletedFn<V>>>,
    reload: Notify,
    stop: watch::Sender<bool>,
    options: CacheOptions,
}

pub struct IndexedCache<K, V> {
    inner: Arc<IndexedInner<K, V>>,
}

impl<K, V> Clone for IndexedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> IndexedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(load_one: LoadOneFn<K, V>, options: CacheOptions) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(IndexedInner {
                index: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                last_update: RwLock::new(None),
                load_one,
                load_since: RwLock::new(None),
                key_fn: RwLock::new(None),
                deleted_fn: RwLock::new(None),
                reload: Notify::new(),
                stop,
                options,
            }),
        }
    }

    pub fn with_load_since(self, load_since: LoadSinceFn<V>, key_fn: KeyFn<K, V>) -> Self {
        *self
            .inner
            .load_since
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(load_since);
        *self.inner.key_fn.write().unwrap_or_else(|e| e.into_inner()) = Some(key_fn);
        self
    }

    pub fn with_deleted_fn(self, deleted_fn: DeletedFn<V>) -> Self {
        *self
            .inner
            .deleted_fn
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(deleted_fn);
        self
    }

    fn lookup(&self, key: &K) -> Option<Result<V, CacheError>> {
        let index = self.inner.index.read().unwrap_or_else(|e| e.into_inner());
        let entry = index.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(match &entry.value {
            Some(value) => Ok(value.clone()),
            None => Err(CacheError::KeyNotFound),
        })
    }

    fn insert(&self, key: K, value: Option<V>) {
        let ttl = if value.is_some() {
            self.inner.options.ttl
        } else {
            self.inner.options.negative_ttl
        };
        self.inner
            .index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key,
                Entry {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
    }

    /// Wait-free read on a warm key; singleflight load on a cold one. A
    /// not-found result is negative-cached for the short TTL.
    pub async fn get(&self, key: &K) -> Result<V, CacheError> {
        if let Some(hit) = self.lookup(key) {
            return hit;
        }

        let gate = {
            let mut inflight = self.inner.inflight.lock().await;
            inflight.entry(key.clone()).or_default().clone()
        };
        let _guard = gate.lock().await;

        // A concurrent caller may have loaded while we waited on the gate.
        if let Some(hit) = self.lookup(key) {
            return hit;
        }

        let result = (self.inner.load_one)(key.clone()).await;
        match &result {
            Ok(value) => self.insert(key.clone(), Some(value.clone())),
            Err(CacheError::KeyNotFound) => self.insert(key.clone(), None),
            Err(_) => {}
        }
        self.inner.inflight.lock().await.remove(key);
        result
    }

    pub fn invalidate(&self, key: &K) {
        self.inner
            .index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub async fn reload(&self, key: &K) -> Result<V, CacheError> {
        self.invalidate(key);
        self.get(key).await
    }

    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.inner
            .index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.expires_at > now);
    }

    pub fn trigger_async_reload(&self) {
        self.inner.reload.notify_one();
    }

    pub fn stop(&self) {
        let _ = self.inner.stop.send(true);
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .last_update
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// One incremental refresh: merge items changed since the high-water
    /// mark, advance it, and sweep expired entries.
    pub async fn refresh_once(&self) -> Result<(), CacheError> {
        let load_since = self
            .inner
            .load_since
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let key_fn = self
            .inner
            .key_fn
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let deleted_fn = self
            .inner
            .deleted_fn
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let (Some(load_since), Some(key_fn)) = (load_since, key_fn) else {
            return Ok(());
        };

        let since = self.last_update();
        let (items, new_update) = load_since(since).await?;
        for item in items {
            let key = key_fn(&item);
            if deleted_fn.as_ref().is_some_and(|deleted| deleted(&item)) {
                self.invalidate(&key);
            } else {
                self.insert(key, Some(item));
            }
        }
        *self
            .inner
            .last_update
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(new_update);
        self.cleanup_expired();
        Ok(())
    }

    /// Spawn the periodic refresh loop. Stops on [`IndexedCache::stop`];
    /// stopping twice is a no-op.
    pub fn start(&self) {
        let cache = self.clone();
        let mut stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(cache.inner.options.refresh_interval) => {}
                    _ = cache.inner.reload.notified() => {
                        // Collapse bursts of triggers into one refresh.
                        tokio::time::sleep(cache.inner.options.debounce_delay).await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                }
                if *stop.borrow() {
                    return;
                }
                if let Err(err) = cache.refresh_once().await {
                    tracing::warn!(error = %err, "indexed cache refresh failed");
                }
            }
        });
    }

    /// Attach a watcher bus. Invalidation events apply immediately;
    /// reloads run under a 30-second deadline.
    pub fn watch(&self, mut events: broadcast::Receiver<WatchEvent<K>>) {
        let cache = self.clone();
        let mut stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                        continue;
                    }
                };
                match event {
                    Ok(WatchEvent::ForceRefresh) => cache.trigger_async_reload(),
                    Ok(WatchEvent::Refresh { updated_at }) => {
                        if cache.last_update().is_none_or(|last| updated_at > last) {
                            cache.trigger_async_reload();
                        }
                    }
                    Ok(WatchEvent::InvalidateKeys(keys)) => {
                        for key in &keys {
                            cache.invalidate(key);
                        }
                    }
                    Ok(WatchEvent::ReloadKeys(keys)) => {
                        let deadline = Duration::from_secs(30);
                        for key in &keys {
                            if tokio::time::timeout(deadline, cache.reload(key))
                                .await
                                .is_err()
                            {
                                tracing::warn!("cache reload timed out");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        tracing::debug!(dropped, "watcher lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_loader(
        counter: Arc<AtomicUsize>,
        known: &'static str,
    ) -> LoadOneFn<String, String> {
        Arc::new(move |key: String| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if key == known {
                    Ok(format!("value-of-{key}"))
                } else {
                    Err(CacheError::KeyNotFound)
                }
            })
        })
    }

    #[tokio::test]
    async fn test_hit_and_miss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = IndexedCache::new(
            counting_loader(calls.clone(), "alpha"),
            CacheOptions::default(),
        );

        assert_eq!(
            cache.get(&"alpha".to_owned()).await.unwrap(),
            "value-of-alpha"
        );
        assert_eq!(
            cache.get(&"alpha".to_owned()).await.unwrap(),
            "value-of-alpha"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_cache_prevents_penetration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = IndexedCache::new(
            counting_loader(calls.clone(), "alpha"),
            CacheOptions::default(),
        );

        let missing = "ghost".to_owned();
        assert_eq!(cache.get(&missing).await, Err(CacheError::KeyNotFound));
        assert_eq!(cache.get(&missing).await, Err(CacheError::KeyNotFound));
        assert_eq!(cache.get(&missing).await, Err(CacheError::KeyNotFound));
        // Only the first miss reached the loader.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_singleflight_cold_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let loader: LoadOneFn<String, String> = Arc::new(move |key: String| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(format!("value-of-{key}"))
            })
        });
        let cache = IndexedCache::new(loader, CacheOptions::default());

        let left = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&"alpha".to_owned()).await })
        };
        let right = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&"alpha".to_owned()).await })
        };
        assert_eq!(left.await.unwrap().unwrap(), "value-of-alpha");
        assert_eq!(right.await.unwrap().unwrap(), "value-of-alpha");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_reload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = IndexedCache::new(
            counting_loader(calls.clone(), "alpha"),
            CacheOptions::default(),
        );
        let key = "alpha".to_owned();
        cache.get(&key).await.unwrap();
        cache.invalidate(&key);
        cache.get(&key).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.reload(&key).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refresh_once_merges_and_advances_watermark() {
        #[derive(Clone, Debug, PartialEq)]
        struct Item {
            id: String,
            deleted: bool,
        }

        let load_one: LoadOneFn<String, Item> =
            Arc::new(|_key| Box::pin(async { Err(CacheError::KeyNotFound) }));
        let load_since: LoadSinceFn<Item> = Arc::new(|since| {
            Box::pin(async move {
                assert!(since.is_none());
                Ok((
                    vec![
                        Item {
                            id: "keep".into(),
                            deleted: false,
                        },
                        Item {
                            id: "gone".into(),
                            deleted: true,
                        },
                    ],
                    Utc::now(),
                ))
            })
        });
        let cache = IndexedCache::new(load_one, CacheOptions::default())
            .with_load_since(load_since, Arc::new(|item: &Item| item.id.clone()))
            .with_deleted_fn(Arc::new(|item: &Item| item.deleted));

        cache.refresh_once().await.unwrap();
        assert!(cache.get(&"keep".to_owned()).await.is_ok());
        assert!(cache.last_update().is_some());
        // Deleted items never land; the loader negative-caches them.
        assert_eq!(
            cache.get(&"gone".to_owned()).await,
            Err(CacheError::KeyNotFound)
        );
    }

    #[tokio::test]
    async fn test_watcher_invalidate_keys() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = IndexedCache::new(
            counting_loader(calls.clone(), "alpha"),
            CacheOptions::default(),
        );
        let (tx, rx) = broadcast::channel(8);
        cache.watch(rx);

        let key = "alpha".to_owned();
        cache.get(&key).await.unwrap();
        tx.send(WatchEvent::InvalidateKeys(vec![key.clone()])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.get(&key).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = IndexedCache::new(
            counting_loader(calls.clone(), "alpha"),
            CacheOptions::default(),
        );
        cache.start();
        cache.stop();
        cache.stop();
    }

    #[tokio::test]
    async fn test_single_value_cache_refresh() {
        let refresh: RefreshFn<u64> = Arc::new(|current, _last| {
            Box::pin(async move {
                let next = current.unwrap_or(0) + 1;
                Ok((next, Utc::now(), true))
            })
        });
        let cache = Cache::new(refresh, CacheOptions::default());
        assert_eq!(cache.get(), None);
        cache.refresh_once().await.unwrap();
        assert_eq!(cache.get(), Some(1));
        cache.refresh_once().await.unwrap();
        assert_eq!(cache.get(), Some(2));
        cache.stop();
    }
}
