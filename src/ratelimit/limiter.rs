//! Fixed-window admission decisions.

use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::config::CounterMode;
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

use super::resolver::EffectiveConfig;

/// Outcome of a single admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is admitted; `count` is the window's count including it.
    Allowed { count: u64 },
    /// The window's cap is reached. The stored counter was left untouched.
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// The decision engine counting requests per identity in the counter store.
///
/// The first request of an identity opens a window of `block_time` seconds
/// with a count of 1. Each admitted request bumps the count and re-arms the
/// window's expiry to the full `block_time`. Once the count reaches
/// `max_request`, further requests are denied without touching the counter,
/// so the window runs out at its last re-armed expiry.
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    mode: CounterMode,
}

impl RateLimiter {
    /// Create a rate limiter using separate read and write calls.
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self::with_mode(counters, CounterMode::GetSet)
    }

    /// Create a rate limiter with an explicit counter mode.
    pub fn with_mode(counters: Arc<dyn CounterStore>, mode: CounterMode) -> Self {
        Self { counters, mode }
    }

    /// Decide whether `identity` may make another request under `cfg`.
    ///
    /// Counter store failures and unparseable counters are errors; no
    /// request is admitted without a successful store round-trip.
    pub async fn decide(&self, identity: &str, cfg: &EffectiveConfig) -> Result<Decision> {
        trace!(
            identity = %identity,
            max_request = cfg.max_request,
            mode = ?self.mode,
            "Checking rate limit"
        );

        let decision = match self.mode {
            CounterMode::GetSet => self.decide_get_set(identity, cfg).await?,
            CounterMode::Atomic => self.decide_atomic(identity, cfg).await?,
        };

        match decision {
            Decision::Allowed { count } => {
                debug!(identity = %identity, count, limit = cfg.max_request, "Request admitted");
            }
            Decision::Denied => {
                info!(identity = %identity, limit = cfg.max_request, "Rate limit exceeded");
            }
        }
        Ok(decision)
    }

    /// Read the count, then write the bumped count.
    ///
    /// Two requests for the same identity can read the same count and both
    /// be admitted.
    async fn decide_get_set(&self, identity: &str, cfg: &EffectiveConfig) -> Result<Decision> {
        let Some(count) = self.current_count(identity).await? else {
            self.counters.set(identity, "1", cfg.block_time).await?;
            return Ok(Decision::Allowed { count: 1 });
        };

        if count.saturating_add(1) > cfg.max_request {
            return Ok(Decision::Denied);
        }

        let next = count + 1;
        self.counters
            .set(identity, &next.to_string(), cfg.block_time)
            .await?;
        Ok(Decision::Allowed { count: next })
    }

    async fn decide_atomic(&self, identity: &str, cfg: &EffectiveConfig) -> Result<Decision> {
        let counted = self
            .counters
            .increment_within(identity, cfg.max_request, cfg.block_time)
            .await?;

        Ok(match counted {
            Some(count) => Decision::Allowed { count },
            None => Decision::Denied,
        })
    }

    /// The stored count for `identity`, or `None` when no window is open.
    pub async fn current_count(&self, identity: &str) -> Result<Option<u64>> {
        let Some(value) = self.counters.get(identity).await? else {
            return Ok(None);
        };

        value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| TurnstileError::MalformedCounter {
                key: identity.to_string(),
                value,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{self, FailingCounterStore};
    use crate::store::{CounterStore, LimitType, MemoryCounterStore, StoreError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Counter store whose reads wait until two callers have arrived, so both
    /// observe the same count.
    struct LockstepReads {
        inner: MemoryCounterStore,
        barrier: Barrier,
    }

    #[async_trait]
    impl CounterStore for LockstepReads {
        async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
            self.barrier.wait().await;
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> std::result::Result<(), StoreError> {
            self.inner.set(key, value, ttl).await
        }

        async fn increment_within(
            &self,
            key: &str,
            limit: u64,
            ttl: Duration,
        ) -> std::result::Result<Option<u64>, StoreError> {
            self.inner.increment_within(key, limit, ttl).await
        }
    }

    async fn race_at_cap(mode: CounterMode) -> (Decision, Decision) {
        let store = Arc::new(LockstepReads {
            inner: MemoryCounterStore::new(),
            barrier: Barrier::new(2),
        });
        store.set("k", "4", Duration::from_secs(60)).await.unwrap();

        let limiter = RateLimiter::with_mode(store, mode);
        let cfg = effective(5, 60);
        let (a, b) = tokio::join!(limiter.decide("k", &cfg), limiter.decide("k", &cfg));
        (a.unwrap(), b.unwrap())
    }

    fn effective(max_request: u64, block_time_secs: u64) -> EffectiveConfig {
        EffectiveConfig {
            max_request,
            block_time: Duration::from_secs(block_time_secs),
            limit_type: LimitType::Global,
        }
    }

    fn limiters() -> Vec<(Arc<MemoryCounterStore>, RateLimiter)> {
        [CounterMode::GetSet, CounterMode::Atomic]
            .into_iter()
            .map(|mode| {
                let store = Arc::new(MemoryCounterStore::new());
                let limiter = RateLimiter::with_mode(store.clone(), mode);
                (store, limiter)
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_opens_window() {
        for (store, limiter) in limiters() {
            let decision = limiter.decide("1.2.3.4", &effective(10, 60)).await.unwrap();

            assert_eq!(decision, Decision::Allowed { count: 1 });
            assert_eq!(store.get("1.2.3.4").await.unwrap(), Some("1".to_string()));
            assert_eq!(store.ttl("1.2.3.4"), Some(Duration::from_secs(60)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_enforced() {
        for (_, limiter) in limiters() {
            let cfg = effective(10, 60);
            let mut allowed = 0;
            for _ in 0..15 {
                if limiter.decide("1.2.3.4", &cfg).await.unwrap().is_allowed() {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, 10);
            assert_eq!(limiter.current_count("1.2.3.4").await.unwrap(), Some(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_does_not_mutate() {
        for (store, limiter) in limiters() {
            let cfg = effective(2, 60);
            limiter.decide("k", &cfg).await.unwrap();
            limiter.decide("k", &cfg).await.unwrap();

            tokio::time::advance(Duration::from_secs(15)).await;
            assert_eq!(limiter.decide("k", &cfg).await.unwrap(), Decision::Denied);

            assert_eq!(store.get("k").await.unwrap(), Some("2".to_string()));
            assert_eq!(store.ttl("k"), Some(Duration::from_secs(45)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_request_rearms_window() {
        for (store, limiter) in limiters() {
            let cfg = effective(5, 60);
            limiter.decide("k", &cfg).await.unwrap();

            tokio::time::advance(Duration::from_secs(50)).await;
            limiter.decide("k", &cfg).await.unwrap();
            assert_eq!(store.ttl("k"), Some(Duration::from_secs(60)));

            tokio::time::advance(Duration::from_secs(50)).await;
            assert_eq!(
                limiter.decide("k", &cfg).await.unwrap(),
                Decision::Allowed { count: 3 }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_resets_count() {
        for (_, limiter) in limiters() {
            let cfg = effective(10, 60);
            for _ in 0..15 {
                limiter.decide("1.2.3.4", &cfg).await.unwrap();
            }
            assert_eq!(limiter.decide("1.2.3.4", &cfg).await.unwrap(), Decision::Denied);

            tokio::time::advance(Duration::from_secs(61)).await;
            assert_eq!(
                limiter.decide("1.2.3.4", &cfg).await.unwrap(),
                Decision::Allowed { count: 1 }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_identities_are_isolated() {
        for (_, limiter) in limiters() {
            let cfg = effective(3, 60);
            for _ in 0..5 {
                limiter.decide("exhausted", &cfg).await.unwrap();
            }
            assert_eq!(limiter.decide("exhausted", &cfg).await.unwrap(), Decision::Denied);
            assert!(limiter.decide("fresh", &cfg).await.unwrap().is_allowed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_counter_is_infrastructure_error() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set("k", "not-a-number", Duration::from_secs(60)).await.unwrap();
        let limiter = RateLimiter::new(store);

        let err = limiter.decide("k", &effective(10, 60)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::MalformedCounter { .. }));
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_an_allow() {
        for mode in [CounterMode::GetSet, CounterMode::Atomic] {
            let counters = Arc::new(FailingCounterStore(testing::timed_out));
            let limiter = RateLimiter::with_mode(counters, mode);
            let err = limiter.decide("k", &effective(10, 60)).await.unwrap_err();
            assert!(matches!(err, TurnstileError::Store(StoreError::Timeout(_))));
        }
    }

    #[tokio::test]
    async fn test_get_set_race_admits_past_cap() {
        let (a, b) = race_at_cap(CounterMode::GetSet).await;
        assert_eq!(a, Decision::Allowed { count: 5 });
        assert_eq!(b, Decision::Allowed { count: 5 });
    }

    #[tokio::test]
    async fn test_atomic_mode_holds_cap_under_contention() {
        let (a, b) = race_at_cap(CounterMode::Atomic).await;
        let allowed = [a, b].iter().filter(|d| d.is_allowed()).count();
        assert_eq!(allowed, 1);
        assert!([a, b].contains(&Decision::Denied));
    }
}
