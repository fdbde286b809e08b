//! Redis-backed cache, shared by every replica pointing at the same server.
use std::{sync::Mutex, time::Duration};

use redis::{Client, Connection};

use super::{Cache, CacheError, CacheResult};

/// Number of keys requested per `SCAN` round trip during pattern deletion.
const SCAN_BATCH: usize = 500;

/// A [`Cache`] stored in Redis.
///
/// Holds a single connection that is re-established lazily after a failure.
pub struct RedisCache {
    client: Client,
    connection: Mutex<Option<Connection>>,
}

impl RedisCache {
    /// Create a cache for the server at `url`, e.g. `redis://127.0.0.1:6379/0`.
    ///
    /// The connection is opened on first use.
    pub fn new(url: &str) -> CacheResult<RedisCache> {
        let client = Client::open(url)?;
        Ok(RedisCache {
            client,
            connection: Mutex::new(None),
        })
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> CacheResult<T> {
        let mut slot = self.connection.lock().map_err(|_| CacheError::Poisoned)?;
        let connection = match slot.take() {
            Some(connection) => connection,
            None => self.client.get_connection()?,
        };
        let connection = slot.insert(connection);

        let result = f(connection);
        if let Err(err) = &result {
            if err.is_io_error() || err.is_connection_dropped() {
                log::debug!(target: "flagwise", "dropping redis connection after error: {err}");
                *slot = None;
            }
        }
        Ok(result?)
    }
}

impl Cache for RedisCache {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.with_connection(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        // PX takes milliseconds and rejects zero.
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query(conn)
        })
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.with_connection(|conn| redis::cmd("DEL").arg(key).query(conn))
    }

    fn delete_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let glob = format!("*{}*", escape_glob(pattern));
        self.with_connection(|conn| {
            let mut deleted = 0;
            let mut cursor: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&glob)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query(conn)?;
                if !keys.is_empty() {
                    let removed: usize = redis::cmd("DEL").arg(&keys).query(conn)?;
                    deleted += removed;
                }
                if next == 0 {
                    return Ok(deleted);
                }
                cursor = next;
            }
        })
    }

    fn exists(&self, key: &str) -> CacheResult<bool> {
        self.with_connection(|conn| redis::cmd("EXISTS").arg(key).query(conn))
    }
}

/// Escape characters that are special in Redis glob patterns, so `pattern` matches literally.
fn escape_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
