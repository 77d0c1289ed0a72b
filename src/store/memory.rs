//! In-process counter store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{CounterStore, StoreError};

/// A stored counter value and the instant it stops being visible.
#[derive(Debug, Clone)]
struct ExpiringValue {
    value: String,
    expires_at: Instant,
}

impl ExpiringValue {
    fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counter store backed by a concurrent map.
///
/// Expiry follows the tokio clock, so paused-time tests can step through
/// windows. Expired entries read as absent and are dropped lazily or by
/// [`MemoryCounterStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, ExpiringValue>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time left before `key` expires, if it is live.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.expires_at - now)
    }

    /// Spawn a task purging expired entries every `interval`, which must be
    /// non-zero.
    pub fn spawn_purge_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), ExpiringValue::new(value, ttl));
        Ok(())
    }

    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();

        // The entry guard holds the shard lock for the whole check-and-set.
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(ExpiringValue::new("1", ttl));
                Ok(Some(1))
            }
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.is_expired(now) {
                    *current = ExpiringValue::new("1", ttl);
                    return Ok(Some(1));
                }

                let count: u64 = current.value.parse().map_err(|_| {
                    StoreError::Malformed(format!("counter {key:?} holds {:?}", current.value))
                })?;

                if count.saturating_add(1) > limit {
                    return Ok(None);
                }

                *current = ExpiringValue::new((count + 1).to_string(), ttl);
                Ok(Some(count + 1))
            }
        }
    }
}
