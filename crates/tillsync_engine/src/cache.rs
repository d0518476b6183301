//! Key-value cache with per-entry TTL.
//!
//! Sessions, offline queues, packages and cached statistics live here as
//! CBOR-encoded values.

use crate::error::EngineResult;
use moka::sync::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tillsync_protocol::{from_cbor, to_cbor};

/// Key-value store with optional expiry.
pub trait KvCache: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Writes a value. `None` keeps it until evicted or deleted.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);

    /// Removes a value.
    fn delete(&self, key: &str);
}

/// Reads and decodes a CBOR value.
pub fn get_decoded<T: DeserializeOwned>(cache: &dyn KvCache, key: &str) -> EngineResult<Option<T>> {
    match cache.get(key) {
        Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a CBOR value.
pub fn set_encoded<T: Serialize>(
    cache: &dyn KvCache,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> EngineResult<()> {
    cache.set(key, to_cbor(value)?, ttl);
    Ok(())
}

#[derive(Clone)]
struct CacheEntry {
    bytes: Vec<u8>,
    ttl: Option<Duration>,
}

struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process cache backed by `moka`.
pub struct MemoryCache {
    inner: Cache<String, CacheEntry>,
}

impl MemoryCache {
    /// Creates a cache holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();
        Self { inner }
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.get(key).map(|entry| entry.bytes)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.inner.insert(key.to_string(), CacheEntry { bytes: value, ttl });
    }

    fn delete(&self, key: &str) {
        self.inner.invalidate(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let cache = MemoryCache::default();
        cache.set("a", vec![1, 2, 3], None);
        assert_eq!(cache.get("a"), Some(vec![1, 2, 3]));

        cache.delete("a");
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn entries_expire() {
        let cache = MemoryCache::default();
        cache.set("short", vec![1], Some(Duration::from_millis(20)));
        cache.set("long", vec![2], Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(vec![2]));
    }

    #[test]
    fn typed_helpers() {
        let cache = MemoryCache::default();
        set_encoded(&cache, "ids", &vec!["s1".to_string(), "s2".to_string()], None).unwrap();
        let ids: Option<Vec<String>> = get_decoded(&cache, "ids").unwrap();
        assert_eq!(ids, Some(vec!["s1".to_string(), "s2".to_string()]));

        let missing: Option<Vec<String>> = get_decoded(&cache, "nope").unwrap();
        assert!(missing.is_none());

        cache.set("junk", vec![0xff], None);
        assert!(get_decoded::<Vec<String>>(&cache, "junk").is_err());
    }
}
