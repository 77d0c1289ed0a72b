//! External state the admission engine depends on.
//!
//! Two narrow contracts live here: the [`ConfigStore`] holding persisted
//! per-identity overrides and the [`CounterStore`] holding expiring request
//! counters. Both are shared across every in-flight request and are expected
//! to serialize their own operations.

mod memory;
mod overrides;
mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryCounterStore;
pub use overrides::{LimitType, MemoryConfigStore, RateLimitConfig};
pub use redis_store::RedisCounterStore;

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("an override for {0:?} already exists")]
    Conflict(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed stored value: {0}")]
    Malformed(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Persisted table of per-identity rate limit overrides.
///
/// Lookups report a missing record as `Ok(None)`; the admission path only
/// ever calls [`ConfigStore::get_by_key`]. The mutating operations back the
/// management endpoints.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Find the override whose `config_value` equals `key`.
    async fn get_by_key(&self, key: &str) -> Result<Option<RateLimitConfig>, StoreError>;

    /// Find an override by its store-assigned id.
    async fn get_by_id(&self, id: u64) -> Result<Option<RateLimitConfig>, StoreError>;

    /// All overrides, ordered by id.
    async fn list(&self) -> Result<Vec<RateLimitConfig>, StoreError>;

    /// Insert a new override and return it with its assigned id.
    async fn create(&self, config: RateLimitConfig) -> Result<RateLimitConfig, StoreError>;

    /// Replace every field but the id of an existing override.
    async fn update(&self, id: u64, config: RateLimitConfig)
        -> Result<RateLimitConfig, StoreError>;

    /// Remove an override.
    async fn delete(&self, id: u64) -> Result<(), StoreError>;
}

/// Expiring key-value cache holding string-encoded request counts.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the value under `key`. An absent or expired key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Check and bump the counter under `key` as one indivisible step.
    ///
    /// An absent key is set to `1` with `ttl`. A present count `n` with
    /// `n + 1 > limit` is left untouched and `Ok(None)` is returned.
    /// Otherwise the key is set to `n + 1`, its expiry re-armed to `ttl`,
    /// and the new count returned.
    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError>;
}
