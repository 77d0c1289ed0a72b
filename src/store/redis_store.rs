//! Redis-backed counter store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{CounterStore, StoreError};

/// Check-and-increment executed server-side so no other client interleaves.
///
/// Returns the new count, or -1 when the cap would be exceeded.
const INCREMENT_WITHIN_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], '1', 'EX', ARGV[2])
  return 1
end
local count = tonumber(current)
if not count then
  return redis.error_reply('malformed counter value')
end
if count + 1 > tonumber(ARGV[1]) then
  return -1
end
redis.call('SET', KEYS[1], tostring(count + 1), 'EX', ARGV[2])
return count + 1
"#;

/// Counter store talking to a Redis server.
///
/// Every call runs under the configured timeout; an elapsed timeout is
/// reported as [`StoreError::Timeout`].
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    timeout: Duration,
    script: redis::Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to the server at `redis_url` and verify it answers `PING`.
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = with_timeout(timeout, ConnectionManager::new(client)).await?;

        let store = Self {
            connection,
            timeout,
            script: redis::Script::new(INCREMENT_WITHIN_SCRIPT),
        };

        let mut conn = store.connection.clone();
        let _: String = with_timeout(timeout, redis::cmd("PING").query_async(&mut conn)).await?;
        info!(timeout_ms = timeout.as_millis() as u64, "Connected to Redis counter store");

        Ok(store)
    }
}

/// Run a Redis call under `timeout`, flattening both failure layers.
async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Redis rejects `EX 0`, so sub-second windows round up to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> =
            with_timeout(self.timeout, redis::cmd("GET").arg(key).query_async(&mut conn)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs(ttl));
        let _: () = with_timeout(self.timeout, cmd.query_async(&mut conn)).await?;
        debug!(key = %key, value = %value, ttl_secs = ttl_secs(ttl), "Counter written");
        Ok(())
    }

    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(limit).arg(ttl_secs(ttl));

        let count: i64 = with_timeout(self.timeout, invocation.invoke_async(&mut conn)).await?;
        Ok(u64::try_from(count).ok())
    }
}
