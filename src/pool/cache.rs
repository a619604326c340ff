//! Path-keyed response cache.
//!
//! Bodies of proxied `GET` responses are admitted under the request path
//! and served on later lookups without touching a backend. Admission is
//! frequency-biased (TinyLFU) with LRU-leaning eviction, bounded by a
//! byte budget enforced through a weigher. The cache is advisory: lookups
//! and admissions cannot fail, and callers never take a lock.

use bytes::Bytes;
use moka::sync::Cache as MokaCache;

/// Total byte budget for cached bodies.
const DEFAULT_MAX_BYTES: u64 = 1 << 30;

/// Shared, internally-synchronized response cache.
#[derive(Clone)]
pub struct ResponseCache {
    inner: MokaCache<String, Bytes>,
}

impl ResponseCache {
    /// Create a cache bounded by the default 1 GiB budget.
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_BYTES)
    }

    /// Create a cache bounded by `max_bytes` of key and body data.
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, value: &Bytes| -> u32 {
                (key.len() + value.len()).min(u32::MAX as usize) as u32
            })
            .build();

        Self { inner }
    }

    /// Look up the cached body for a request path.
    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.inner.get(path)
    }

    /// Admit a response body under a request path.
    pub fn insert(&self, path: &str, body: Bytes) {
        self.inner.insert(path.to_string(), body);
    }
}

#[cfg(test)]
impl ResponseCache {
    /// Number of entries currently resident.
    fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_returns_none() {
        let cache = ResponseCache::new();
        assert!(cache.get("/foo").is_none());
    }

    #[test]
    fn test_admitted_body_is_returned_byte_identical() {
        let cache = ResponseCache::new();
        let body = Bytes::from_static(b"hello world");

        cache.insert("/foo", body.clone());
        assert_eq!(cache.get("/foo"), Some(body));
    }

    #[test]
    fn test_paths_are_isolated() {
        let cache = ResponseCache::new();
        cache.insert("/foo", Bytes::from_static(b"foo"));
        cache.insert("/bar", Bytes::from_static(b"bar"));

        assert_eq!(cache.get("/foo"), Some(Bytes::from_static(b"foo")));
        assert_eq!(cache.get("/bar"), Some(Bytes::from_static(b"bar")));
        assert!(cache.get("/baz").is_none());
    }

    #[test]
    fn test_last_admission_wins() {
        let cache = ResponseCache::new();
        cache.insert("/foo", Bytes::from_static(b"old"));
        cache.insert("/foo", Bytes::from_static(b"new"));
        assert_eq!(cache.get("/foo"), Some(Bytes::from_static(b"new")));
    }

    #[test]
    fn test_entry_count_tracks_admissions() {
        let cache = ResponseCache::new();
        assert_eq!(cache.entry_count(), 0);
        cache.insert("/foo", Bytes::from_static(b"foo"));
        cache.insert("/bar", Bytes::from_static(b"bar"));
        assert_eq!(cache.entry_count(), 2);
    }
}
