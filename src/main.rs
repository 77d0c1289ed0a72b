use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use turnstile::config::{CounterBackend, ServiceConfig};
use turnstile::http::HttpServer;
use turnstile::ratelimit::{Admission, ConfigResolver, RateLimiter};
use turnstile::store::{
    ConfigStore, CounterStore, MemoryConfigStore, MemoryCounterStore, RedisCounterStore,
};

/// Fixed-window HTTP admission control.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file; skipped when it does not exist
    #[arg(short, long, default_value = "turnstile.yaml")]
    config: PathBuf,

    /// Listen address, overriding `server.bind_addr`
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(args.json_logs.then(|| fmt::layer().json()))
        .with((!args.json_logs).then(|| fmt::layer().with_target(false)))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    info!(
        bind_addr = %config.server.bind_addr,
        max_requests = config.limits.max_requests,
        block_time_secs = config.limits.block_time_secs,
        backend = ?config.counter_store.backend,
        mode = ?config.counter_store.mode,
        "Configuration loaded"
    );

    let counters: Arc<dyn CounterStore> = match config.counter_store.backend {
        CounterBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            store.spawn_purge_task(config.counter_store.purge_interval());
            store
        }
        CounterBackend::Redis => {
            let url = config.counter_store.redis_url.as_deref().unwrap_or_default();
            Arc::new(RedisCounterStore::connect(url, config.counter_store.timeout()).await?)
        }
    };

    let overrides: Arc<dyn ConfigStore> = match &config.overrides.path {
        Some(path) => Arc::new(MemoryConfigStore::from_file(path)?),
        None => Arc::new(MemoryConfigStore::new()),
    };

    let admission = Arc::new(Admission::new(
        ConfigResolver::new(overrides, config.limits),
        RateLimiter::with_mode(counters, config.counter_store.mode),
    ));
    info!("Admission control initialized");

    // Run the server with graceful shutdown on Ctrl+C
    HttpServer::new(config.server.bind_addr, admission)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
