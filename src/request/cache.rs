use crate::http::ApiError;
use crate::logger::*;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, WeakShared};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

type Fill<T> = Shared<BoxFuture<'static, Result<T, ApiError>>>;
type WeakFill<T> = WeakShared<BoxFuture<'static, Result<T, ApiError>>>;

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub stored_at: Instant,
    ttl: Option<Duration>,
}

impl<T> CacheEntry<T> {
    fn new(payload: T, ttl: Option<Duration>) -> Self {
        Self {
            payload,
            stored_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.stored_at.elapsed() >= ttl)
    }
}

/// Keyed, TTL-bounded store of successful results.
///
/// Cloning is cheap and yields a handle onto the same namespace, which is how
/// two controllers share a cache key. Concurrent fills of one key are
/// collapsed onto a single service call.
pub struct ResponseCache<T> {
    inner: Arc<CacheInner<T>>,
}

struct CacheInner<T> {
    entries: DashMap<String, CacheEntry<T>>,
    in_flight: DashMap<String, (u64, Option<WeakFill<T>>)>,
    next_fill: AtomicU64,
}

impl<T> Clone for ResponseCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for ResponseCache<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                next_fill: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// The live payload under `key`. An expired entry is evicted on the way.
    pub fn get(&self, key: &str) -> Option<T> {
        let entry = self.inner.entries.get(key)?;
        if !entry.is_expired() {
            return Some(entry.payload.clone());
        }
        drop(entry);
        trace!(key, "cache entry expired");
        self.inner.entries.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    pub fn put(&self, key: &str, payload: T, ttl: Option<Duration>) {
        self.inner
            .entries
            .insert(key.to_string(), CacheEntry::new(payload, ttl));
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.entries.remove(key);
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Resolve `key` through one shared call.
    ///
    /// If a fill of `key` is already running, the caller joins it and `make`
    /// is never invoked. The fill is driven by the callers awaiting it: once
    /// every one of them has stopped waiting, the call is dropped and nothing
    /// is stored.
    pub fn fill<F>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        make: F,
    ) -> BoxFuture<'static, Result<T, ApiError>>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, ApiError>>,
    {
        if let Some(hit) = self.get(key) {
            return futures_util::future::ready(Ok(hit)).boxed();
        }

        let mut slot = self
            .inner
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| (0, None));
        if let Some(joined) = slot.1.as_ref().and_then(WeakShared::upgrade) {
            trace!(key, fill = slot.0, "joining cache fill");
            return joined.boxed();
        }

        let id = self.inner.next_fill.fetch_add(1, Ordering::Relaxed);
        let fill = self.start_fill(key, id, ttl, make());
        *slot = (id, fill.downgrade());
        drop(slot);
        fill.boxed()
    }

    fn start_fill(
        &self,
        key: &str,
        id: u64,
        ttl: Option<Duration>,
        call: BoxFuture<'static, Result<T, ApiError>>,
    ) -> Fill<T> {
        let inner = self.inner.clone();
        let key = key.to_string();
        debug!(key, fill = id, "starting cache fill");

        async move {
            let result = call.await;
            if let Ok(payload) = &result {
                inner
                    .entries
                    .insert(key.clone(), CacheEntry::new(payload.clone(), ttl));
            }
            inner.in_flight.remove_if(&key, |_, (owner, _)| *owner == id);
            result
        }
        .boxed()
        .shared()
    }
}
