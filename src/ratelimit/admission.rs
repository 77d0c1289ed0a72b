//! Admission control: limit resolution followed by the counting decision.

use tracing::instrument;

use crate::error::Result;

use super::identity::ClientKey;
use super::limiter::{Decision, RateLimiter};
use super::resolver::ConfigResolver;

/// Decides whether a client identity is admitted.
///
/// Shared by every in-flight request; holds no mutable state of its own.
pub struct Admission {
    resolver: ConfigResolver,
    limiter: RateLimiter,
}

impl Admission {
    pub fn new(resolver: ConfigResolver, limiter: RateLimiter) -> Self {
        Self { resolver, limiter }
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    /// Resolve the limits for `key` and run the admission decision.
    #[instrument(skip(self, key), fields(identity = %key, source = ?key.source))]
    pub async fn check(&self, key: &ClientKey) -> Result<Decision> {
        let cfg = self.resolver.resolve(key.as_str()).await?;
        self.limiter.decide(key.as_str(), &cfg).await
    }
}
