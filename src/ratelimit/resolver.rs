//! Effective limit resolution.
//!
//! Limits are resolved in two tiers: a persisted per-identity override is
//! merged field by field over the process-wide defaults, with a zero field
//! meaning "use the default".

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

use crate::config::LimitDefaults;
use crate::error::Result;
use crate::store::{ConfigStore, LimitType, RateLimitConfig, StoreError};

/// The limit parameters a single admission decision runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveConfig {
    /// Requests allowed per window, always greater than zero
    pub max_request: u64,
    /// Window length
    pub block_time: Duration,
    pub limit_type: LimitType,
}

/// Resolves the effective limits for an identity.
pub struct ConfigResolver {
    store: Arc<dyn ConfigStore>,
    defaults: LimitDefaults,
}

impl ConfigResolver {
    /// Create a resolver over `store` falling back to `defaults`.
    pub fn new(store: Arc<dyn ConfigStore>, defaults: LimitDefaults) -> Self {
        Self { store, defaults }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Look up the override for `identity` and merge it over the defaults.
    ///
    /// A missing override is not an error. Any other store failure is.
    pub async fn resolve(&self, identity: &str) -> Result<EffectiveConfig> {
        let found = match self.store.get_by_key(identity).await {
            Ok(found) => found,
            Err(StoreError::NotFound) => None,
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to look up rate limit override");
                return Err(e.into());
            }
        };

        let effective = self.merge(found.as_ref());
        trace!(
            identity = %identity,
            overridden = found.is_some(),
            max_request = effective.max_request,
            block_time_secs = effective.block_time.as_secs(),
            limit_type = %effective.limit_type,
            "Resolved rate limit"
        );
        Ok(effective)
    }

    /// Merge an optional override over the defaults.
    pub fn merge(&self, found: Option<&RateLimitConfig>) -> EffectiveConfig {
        let (max_request, block_time, limit_type) = match found {
            Some(config) => (config.max_request, config.block_time, config.limit_type),
            None => (0, 0, LimitType::Global),
        };

        EffectiveConfig {
            max_request: if max_request == 0 {
                self.defaults.max_requests
            } else {
                max_request
            },
            block_time: if block_time == 0 {
                self.defaults.block_time()
            } else {
                Duration::from_secs(block_time)
            },
            limit_type,
        }
    }
}
