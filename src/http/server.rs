//! HTTP server implementation.

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::handlers::{self, AppState};
use super::middleware::RateLimitLayer;
use crate::error::Result;
use crate::ratelimit::Admission;

/// Build the service router.
///
/// Every route, management endpoints included, sits behind the admission
/// middleware.
pub fn router(admission: Arc<Admission>) -> Router {
    Router::new()
        .route("/rate-limit", get(handlers::rate_limit_info))
        .route(
            "/config",
            get(handlers::get_config)
                .post(handlers::create_config)
                .patch(handlers::update_config)
                .delete(handlers::delete_config),
        )
        .route("/configs", get(handlers::list_configs))
        .layer(RateLimitLayer::new(admission.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(admission))
}

/// HTTP server fronting the admission-controlled routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    admission: Arc<Admission>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, admission: Arc<Admission>) -> Self {
        Self { addr, admission }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have finished.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server");

        let app = router(self.admission).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}
