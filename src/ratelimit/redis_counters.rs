//! Redis-backed shared counters.
//!
//! Counters live under a configurable key prefix and rely on Redis's
//! native `INCR`, `EXPIRE` and `TTL`. A connection manager reconnects in the
//! background; while Redis is unreachable every call errors and the limiter
//! fails open.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::info;

use super::backend::StoreError;
use super::counter::CounterStore;

/// Default prefix for every counter key.
pub const DEFAULT_KEY_PREFIX: &str = "solegate:rl:";

/// Decrement only while the key is alive, so a refund that lands after the
/// window expired does not leave a negative counter without an expiry.
const DECREMENT_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Shared counters stored in Redis.
#[derive(Clone)]
pub struct RedisCounters {
    connection: ConnectionManager,
    key_prefix: String,
    decrement: Script,
}

impl fmt::Debug for RedisCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounters")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounters {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection does
    /// not succeed within `connect_timeout`.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;

        let key_prefix = key_prefix.into();
        info!(key_prefix = %key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            key_prefix,
            decrement: Script::new(DECREMENT_IF_EXISTS),
        })
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.key_prefix, key)
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(self.key(key), 1).await?;
        Ok(value)
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let value: i64 = self
            .decrement
            .key(self.key(key))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let existed: bool = conn.expire(self.key(key), seconds as i64).await?;
        Ok(existed)
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.ttl(self.key(key)).await?;
        Ok(ttl)
    }
}
