//! Response cache keyed by the full request url.
//!
//! Entries are only ever removed explicitly: by the change feed, by [`ResponseCache::evict`]
//! and friends, or when the owning executor goes away. There is no size bound; the set of urls
//! a driver issues against one database is small and stable.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    change_vector: String,
    payload: Bytes,
    generation: u64,
    stored_at: Instant,
}

/// A copy of a cache entry handed out to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub change_vector: String,
    pub payload: Bytes,
    /// Cache generation the entry was stored or last revalidated in
    pub generation: u64,
    /// Time since the entry was stored or last revalidated
    pub age: Duration,
}

/// Thread-safe response cache. Cloning is cheap and yields a handle to the same cache.
///
/// Reads and writes lock only the shard holding their key, so unrelated keys never wait on each
/// other. For a given key the last completed write wins.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    generation: AtomicU64,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<CachedResponse> {
        let now = Instant::now();
        self.inner.entries.get(url).map(|entry| CachedResponse {
            change_vector: entry.change_vector.clone(),
            payload: entry.payload.clone(),
            generation: entry.generation,
            age: now.saturating_duration_since(entry.stored_at),
        })
    }

    /// Returns the entry only if it may be served without asking the server: younger than
    /// `max_age` and not invalidated since it was stored.
    pub fn get_fresh(&self, url: &str, max_age: Duration) -> Option<CachedResponse> {
        let generation = self.generation();
        self.get(url)
            .filter(|cached| cached.age < max_age && cached.generation == generation)
    }

    pub fn set(&self, url: impl Into<String>, change_vector: impl Into<String>, payload: Bytes) {
        self.set_with_generation(url, change_vector, payload, self.generation());
    }

    /// Stores a response fetched by a request sent while the cache was at `generation`.
    ///
    /// If the cache was invalidated while the request was in flight, the payload may predate the
    /// change that caused it, so the entry is kept as a validator only.
    pub fn set_with_generation(
        &self,
        url: impl Into<String>,
        change_vector: impl Into<String>,
        payload: Bytes,
        generation: u64,
    ) {
        let entry = CacheEntry {
            change_vector: change_vector.into(),
            payload,
            generation,
            stored_at: Instant::now(),
        };
        self.inner.entries.insert(url.into(), entry);
    }

    /// The server confirmed the entry was current as of `generation`, the cache generation when
    /// the conditional request went out. Restarts its age.
    pub fn mark_not_modified(&self, url: &str, generation: u64) {
        if let Some(mut entry) = self.inner.entries.get_mut(url) {
            entry.generation = generation;
            entry.stored_at = Instant::now();
        }
    }

    pub fn evict(&self, url: &str) -> bool {
        self.inner.entries.remove(url).is_some()
    }

    /// Drops every entry whose url matches `predicate`. Returns how many were dropped.
    pub fn evict_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let before = self.inner.entries.len();
        self.inner.entries.retain(|url, _| !predicate(url));
        before.saturating_sub(self.inner.entries.len())
    }

    /// Marks every current entry stale without dropping it.
    ///
    /// Stale entries are never served aggressively, but their change vectors still go out as
    /// validators, so an unchanged resource costs a `304` instead of a full download.
    pub fn invalidate(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
        self.invalidate();
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}
