use std::time::{Duration, Instant};

use moka::{sync::Cache as MokaCache, Expiry};

use super::{Cache, CacheResult};

/// Entries never live longer than this, whatever ttl they were stored with.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    ttl: Duration,
}

/// Expires each entry after the ttl it was last written with.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// `InMemoryCache` provides a thread-safe (`Sync`) cache local to the process, backed by `moka`.
///
/// The cache is bounded by entry count. Expired entries are never returned and are reclaimed by
/// moka's housekeeping along with entries evicted for capacity.
#[derive(Clone)]
pub struct InMemoryCache {
    entries: MokaCache<String, Entry>,
}

impl InMemoryCache {
    pub const DEFAULT_MAX_CAPACITY: u64 = 100_000;

    pub fn new() -> InMemoryCache {
        InMemoryCache::with_max_capacity(InMemoryCache::DEFAULT_MAX_CAPACITY)
    }

    /// Create a cache holding at most `max_capacity` entries.
    pub fn with_max_capacity(max_capacity: u64) -> InMemoryCache {
        let entries = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        InMemoryCache { entries }
    }

    /// Number of live entries, after running pending evictions.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        InMemoryCache::new()
    }
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|entry| entry.value))
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let entry = Entry {
            value,
            ttl: ttl.min(MAX_TTL),
        };
        self.entries.insert(key.to_owned(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.invalidate(key);
        Ok(())
    }

    fn delete_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let matching = self
            .entries
            .iter()
            .filter(|(key, _)| key.contains(pattern))
            .map(|(key, _)| key)
            .collect::<Vec<_>>();

        let deleted = matching
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count();
        Ok(deleted)
    }

    fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.contains_key(key))
    }
}
