//! Rate limiting logic.

mod admission;
mod identity;
mod limiter;
mod resolver;

pub use admission::Admission;
pub use identity::{ClientKey, KeySource, API_KEY_HEADER};
pub use limiter::{Decision, RateLimiter};
pub use resolver::{ConfigResolver, EffectiveConfig};
