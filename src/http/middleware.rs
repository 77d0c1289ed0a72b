//! Admission control as a tower middleware.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/rate-limit", get(handler))
//!     .layer(RateLimitLayer::new(admission));
//! ```

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::error;

use crate::ratelimit::{Admission, ClientKey, Decision};

/// Body sent with every 429 response.
pub const LIMIT_EXCEEDED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Layer wrapping services with [`RateLimitService`].
#[derive(Clone)]
pub struct RateLimitLayer {
    admission: Arc<Admission>,
}

impl RateLimitLayer {
    pub fn new(admission: Arc<Admission>) -> Self {
        Self { admission }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            admission: self.admission.clone(),
        }
    }
}

/// Runs the admission check before handing a request to `inner`.
///
/// - admitted: `inner` is called with the request untouched
/// - denied: 429 with [`LIMIT_EXCEEDED_MESSAGE`], `inner` is not called
/// - store failure: 500 with an empty body, `inner` is not called
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    admission: Arc<Admission>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let admission = self.admission.clone();
        // Keep the service that was driven to readiness for this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let key = ClientKey::from_request(&request);

            match admission.check(&key).await {
                Ok(Decision::Allowed { .. }) => inner.call(request).await,
                Ok(Decision::Denied) => Ok(limit_exceeded()),
                Err(e) if e.is_infrastructure() => {
                    error!(identity = %key, error = %e, "Admission store failure, rejecting request");
                    Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
                }
                Err(e) => {
                    error!(identity = %key, error = %e, "Admission check failed, rejecting request");
                    Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
                }
            }
        })
    }
}

fn limit_exceeded() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, LIMIT_EXCEEDED_MESSAGE).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitDefaults;
    use crate::ratelimit::{ConfigResolver, RateLimiter};
    use crate::store::testing::{self, FailingConfigStore, FailingCounterStore};
    use crate::store::{ConfigStore, CounterStore, MemoryConfigStore, MemoryCounterStore};
    use axum::extract::ConnectInfo;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn admission(
        overrides: Arc<dyn ConfigStore>,
        counters: Arc<dyn CounterStore>,
    ) -> Arc<Admission> {
        Arc::new(Admission::new(
            ConfigResolver::new(overrides, LimitDefaults::new(10, 60)),
            RateLimiter::new(counters),
        ))
    }

    /// A router whose handler counts how often it ran.
    fn app(admission: Arc<Admission>, hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    async { "ok" }
                }),
            )
            .layer(RateLimitLayer::new(admission))
    }

    fn request_from(peer: &str, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        if let Some(api_key) = api_key {
            builder = builder.header("API_KEY", api_key);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit_then_window_reset() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(
            admission(
                Arc::new(MemoryConfigStore::new()),
                Arc::new(MemoryCounterStore::new()),
            ),
            hits.clone(),
        );

        let mut statuses = Vec::new();
        for _ in 0..15 {
            let response = app
                .clone()
                .oneshot(request_from("1.2.3.4:40000", None))
                .await
                .unwrap();
            statuses.push(response.status());
        }
        assert!(statuses[..10].iter().all(|s| *s == StatusCode::OK));
        assert!(statuses[10..]
            .iter()
            .all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        tokio::time::advance(Duration::from_secs(61)).await;
        let response = app
            .clone()
            .oneshot(request_from("1.2.3.4:40001", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let overrides = MemoryConfigStore::with_configs(vec![
            crate::store::RateLimitConfig::new("tight").with_max_request(1),
        ])
        .unwrap();
        let app = app(
            admission(Arc::new(overrides), Arc::new(MemoryCounterStore::new())),
            hits.clone(),
        );

        let first = app
            .clone()
            .oneshot(request_from("1.2.3.4:1", Some("tight")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .clone()
            .oneshot(request_from("1.2.3.4:1", Some("tight")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_text(second).await, LIMIT_EXCEEDED_MESSAGE);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_key_and_ip_counted_separately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(
            admission(
                Arc::new(MemoryConfigStore::new()),
                Arc::new(MemoryCounterStore::new()),
            ),
            hits,
        );

        for _ in 0..10 {
            app.clone()
                .oneshot(request_from("1.2.3.4:1", None))
                .await
                .unwrap();
        }
        let blocked = app
            .clone()
            .oneshot(request_from("1.2.3.4:1", None))
            .await
            .unwrap();
        assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

        // Same peer, but an API key moves the request to its own counter.
        let keyed = app
            .clone()
            .oneshot(request_from("1.2.3.4:1", Some("goExpert")))
            .await
            .unwrap();
        assert_eq!(keyed.status(), StatusCode::OK);

        let other_peer = app
            .clone()
            .oneshot(request_from("5.6.7.8:1", None))
            .await
            .unwrap();
        assert_eq!(other_peer.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_config_store_failure_fails_closed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(
            admission(
                Arc::new(FailingConfigStore(testing::unavailable)),
                Arc::new(MemoryCounterStore::new()),
            ),
            hits.clone(),
        );

        let response = app.oneshot(request_from("1.2.3.4:1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_counter_store_failure_fails_closed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(
            admission(
                Arc::new(MemoryConfigStore::new()),
                Arc::new(FailingCounterStore(testing::timed_out)),
            ),
            hits.clone(),
        );

        let response = app.oneshot(request_from("1.2.3.4:1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_counter_fails_closed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counters = Arc::new(MemoryCounterStore::new());
        counters
            .set("1.2.3.4", "garbage", Duration::from_secs(60))
            .await
            .unwrap();
        let app = app(
            admission(Arc::new(MemoryConfigStore::new()), counters),
            hits.clone(),
        );

        let response = app.oneshot(request_from("1.2.3.4:1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
