// ABOUTME: Reference-counted cache of shared heavyweight resources such as container images
// ABOUTME: Concurrent requires share one fetch; handles release their reference exactly once

use crate::error::ResourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Produces the resource for a cache key.
#[async_trait]
pub trait Fetcher<R: Send + Sync + 'static>: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<R, ResourceError>;

    /// Called when an idle resource is evicted by [`ResourceCache::purge_idle`].
    async fn dispose(&self, _key: &str, _resource: Arc<R>) {}
}

/// Counters for observing cache traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub fetches: u64,
    pub acquired: u64,
    pub released: u64,
}

struct Entry<R> {
    cell: Arc<OnceCell<Arc<R>>>,
    references: usize,
    last_used: DateTime<Utc>,
}

struct CacheState<R> {
    entries: HashMap<String, Entry<R>>,
    stats: CacheStats,
}

struct CacheInner<R> {
    fetcher: Arc<dyn Fetcher<R>>,
    state: Mutex<CacheState<R>>,
}

impl<R> CacheInner<R> {
    fn state(&self) -> MutexGuard<'_, CacheState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop one reference on `key`. Evicts the entry if it never resolved.
    fn release(&self, key: &str) {
        let mut state = self.state();
        let Some(entry) = state.entries.get_mut(key) else {
            error!("Released resource {} which is not tracked by the cache", key);
            return;
        };
        if entry.references == 0 {
            error!("Resource {} released more often than acquired", key);
            return;
        }
        entry.references -= 1;
        entry.last_used = Utc::now();
        let unresolved = entry.references == 0 && entry.cell.get().is_none();
        if unresolved {
            state.entries.remove(key);
        }
    }
}

/// Shared cache keyed by a resource specification string.
pub struct ResourceCache<R> {
    inner: Arc<CacheInner<R>>,
}

impl<R> Clone for ResourceCache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + Sync + 'static> ResourceCache<R> {
    pub fn new(fetcher: Arc<dyn Fetcher<R>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                fetcher,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    stats: CacheStats::default(),
                }),
            }),
        }
    }

    /// Acquire a handle on the resource for `key`, fetching it if needed.
    ///
    /// The reference is counted before the fetch starts so an in-flight
    /// resource is never evicted. If the fetch fails the reference is
    /// dropped again and the error returned; nothing needs releasing.
    pub async fn require(&self, key: &str) -> Result<ResourceHandle<R>, ResourceError> {
        let cell = {
            let mut state = self.inner.state();
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Entry {
                    cell: Arc::new(OnceCell::new()),
                    references: 0,
                    last_used: Utc::now(),
                });
            entry.references += 1;
            let cell = Arc::clone(&entry.cell);
            state.stats.acquired += 1;
            cell
        };

        let fetched = cell
            .get_or_try_init(|| async move {
                debug!("Fetching resource {}", key);
                self.inner.state().stats.fetches += 1;
                self.inner.fetcher.fetch(key).await.map(Arc::new)
            })
            .await;

        match fetched {
            Ok(resource) => Ok(ResourceHandle {
                key: key.to_string(),
                resource: Arc::clone(resource),
                cache: Arc::clone(&self.inner),
            }),
            Err(e) => {
                warn!("Failed to acquire resource {}: {}", key, e);
                {
                    let mut state = self.inner.state();
                    state.stats.released += 1;
                }
                self.inner.release(key);
                Err(e)
            }
        }
    }

    /// Number of live references on `key`.
    pub fn references(&self, key: &str) -> usize {
        self.inner
            .state()
            .entries
            .get(key)
            .map(|entry| entry.references)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.state().stats
    }

    /// Evict every resolved entry nobody references and dispose of it.
    /// Returns the evicted keys.
    pub async fn purge_idle(&self) -> Vec<String> {
        let evicted: Vec<(String, Arc<R>)> = {
            let mut state = self.inner.state();
            let idle: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.references == 0 && entry.cell.get().is_some())
                .map(|(key, _)| key.clone())
                .collect();
            idle.into_iter()
                .filter_map(|key| {
                    let entry = state.entries.remove(&key)?;
                    let resource = entry.cell.get().cloned()?;
                    debug!("Evicting {} (last used {})", key, entry.last_used);
                    Some((key, resource))
                })
                .collect()
        };

        let mut keys = Vec::with_capacity(evicted.len());
        for (key, resource) in evicted {
            self.inner.fetcher.dispose(&key, resource).await;
            keys.push(key);
        }
        if !keys.is_empty() {
            info!("Purged {} idle cached resources", keys.len());
        }
        keys
    }
}

/// A counted reference to a cached resource.
///
/// The reference is released when the handle is released or dropped,
/// so it can never be released twice.
pub struct ResourceHandle<R> {
    key: String,
    resource: Arc<R>,
    cache: Arc<CacheInner<R>>,
}

impl<R> ResourceHandle<R> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    /// Give up this reference.
    pub fn release(self) {}
}

impl<R> Deref for ResourceHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R> fmt::Debug for ResourceHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle").field("key", &self.key).finish()
    }
}

impl<R> Drop for ResourceHandle<R> {
    fn drop(&mut self) {
        self.cache.state().stats.released += 1;
        self.cache.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingFetcher {
        fetches: AtomicUsize,
        disposed: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher<String> for CountingFetcher {
        async fn fetch(&self, key: &str) -> Result<String, ResourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if key.starts_with("missing") {
                return Err(ResourceError::Fetch {
                    key: key.to_string(),
                    reason: "not found".to_string(),
                });
            }
            Ok(format!("resource:{}", key))
        }

        async fn dispose(&self, _key: &str, _resource: Arc<String>) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_concurrent_requires_share_one_fetch() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = ResourceCache::new(fetcher.clone() as Arc<dyn Fetcher<String>>);

        let (a, b) = tokio::join!(cache.require("alpine"), cache.require("alpine"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.references("alpine"), 2);
        assert_eq!(*a, "resource:alpine");
        assert!(Arc::ptr_eq(a.resource(), b.resource()));

        a.release();
        assert_eq!(cache.references("alpine"), 1);
        drop(b);
        assert_eq!(cache.references("alpine"), 0);

        let stats = cache.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_reference() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = ResourceCache::new(fetcher.clone() as Arc<dyn Fetcher<String>>);

        let err = cache.require("missing-image").await.unwrap_err();
        assert!(matches!(err, ResourceError::Fetch { .. }));
        assert_eq!(cache.references("missing-image"), 0);

        // A later attempt fetches again rather than reusing the failure.
        assert!(cache.require("missing-image").await.is_err());
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_purge_idle_only_evicts_unreferenced() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = ResourceCache::new(fetcher.clone() as Arc<dyn Fetcher<String>>);

        let held = cache.require("busy").await.unwrap();
        cache.require("idle").await.unwrap().release();

        let purged = cache.purge_idle().await;
        assert_eq!(purged, vec!["idle".to_string()]);
        assert_eq!(fetcher.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.references("busy"), 1);

        drop(held);
        // Re-acquiring an evicted key fetches it again.
        cache.require("idle").await.unwrap();
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);
    }

    /// Uses the default no-op dispose.
    struct PlainFetcher;

    #[async_trait]
    impl Fetcher<Vec<u8>> for PlainFetcher {
        async fn fetch(&self, key: &str) -> Result<Vec<u8>, ResourceError> {
            Ok(key.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn test_default_dispose_runs_on_another_task() {
        let cache = ResourceCache::new(Arc::new(PlainFetcher) as Arc<dyn Fetcher<Vec<u8>>>);
        cache.require("layer").await.unwrap().release();

        let purged = tokio::spawn({
            let cache = cache.clone();
            async move { cache.purge_idle().await }
        })
        .await
        .unwrap();
        assert_eq!(purged, vec!["layer".to_string()]);
        assert_eq!(cache.references("layer"), 0);
    }
}
