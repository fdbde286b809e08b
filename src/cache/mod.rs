//! Result memoization.
//!
//! The manager stores JSON-encoded evaluations under keys of the form
//! `{prefix}:{kind}:{environment}:{key}:{user_id|anonymous}`, with the last three segments
//! percent-encoded. Cache failures never fail an evaluation: reads degrade to a miss and writes
//! are skipped.
use std::time::Duration;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

/// Result type of cache calls.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors reported by a [`Cache`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// A connection lock was poisoned by a panicking caller.
    #[error("cache lock poisoned")]
    Poisoned,

    /// Redis command or connection failure.
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),
}

/// A key/value store with per-entry time-to-live.
pub trait Cache: Send + Sync {
    /// Return the value stored under `key`, or `None` if it is missing or expired.
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete every entry whose key contains `pattern` as a substring. Returns the number of
    /// entries deleted.
    fn delete_pattern(&self, pattern: &str) -> CacheResult<usize>;

    fn exists(&self, key: &str) -> CacheResult<bool>;
}
