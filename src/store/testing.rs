//! Store doubles that fail every call, for exercising infrastructure errors.

use async_trait::async_trait;
use std::time::Duration;

use super::{ConfigStore, CounterStore, RateLimitConfig, StoreError};

/// Builds the error a failing store returns.
pub(crate) type ErrorFn = fn() -> StoreError;

pub(crate) fn unavailable() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

pub(crate) fn timed_out() -> StoreError {
    StoreError::Timeout(Duration::from_secs(1))
}

pub(crate) struct FailingConfigStore(pub ErrorFn);

#[async_trait]
impl ConfigStore for FailingConfigStore {
    async fn get_by_key(&self, _key: &str) -> Result<Option<RateLimitConfig>, StoreError> {
        Err((self.0)())
    }

    async fn get_by_id(&self, _id: u64) -> Result<Option<RateLimitConfig>, StoreError> {
        Err((self.0)())
    }

    async fn list(&self) -> Result<Vec<RateLimitConfig>, StoreError> {
        Err((self.0)())
    }

    async fn create(&self, _config: RateLimitConfig) -> Result<RateLimitConfig, StoreError> {
        Err((self.0)())
    }

    async fn update(
        &self,
        _id: u64,
        _config: RateLimitConfig,
    ) -> Result<RateLimitConfig, StoreError> {
        Err((self.0)())
    }

    async fn delete(&self, _id: u64) -> Result<(), StoreError> {
        Err((self.0)())
    }
}

pub(crate) struct FailingCounterStore(pub ErrorFn);

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err((self.0)())
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err((self.0)())
    }

    async fn increment_within(
        &self,
        _key: &str,
        _limit: u64,
        _ttl: Duration,
    ) -> Result<Option<u64>, StoreError> {
        Err((self.0)())
    }
}
