//! HTTP surface: the admission middleware, the management endpoints and the
//! server that binds them.

mod handlers;
mod middleware;
mod server;

pub use handlers::{ApiError, AppState};
pub use middleware::{RateLimitLayer, RateLimitService, LIMIT_EXCEEDED_MESSAGE};
pub use server::{router, HttpServer};
