use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::{Settings, StoreBackend};
use turnstile::http::{AppState, HttpServer};
use turnstile::ratelimit::{CounterStore, MemoryStore, RateLimiter, RedisStore};

/// Per-identifier request quota enforcement.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        settings.server.listen_addr = listen;
    }
    info!(
        listen_addr = %settings.server.listen_addr,
        default_limit = settings.rate_limiting.default_limit,
        block_duration_secs = settings.rate_limiting.block_duration_secs,
        overrides = settings.rate_limiting.token_limits.len(),
        failure_policy = ?settings.rate_limiting.failure_policy,
        backend = ?settings.store.backend,
        "Configuration loaded"
    );

    let store: Arc<dyn CounterStore> = match settings.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(
                &settings.store.redis_url,
                Duration::from_millis(settings.store.connect_timeout_ms),
                Duration::from_millis(settings.store.response_timeout_ms),
            )
            .await?;
            store.ping().await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_purger(
                store.clone(),
                Duration::from_secs(settings.store.purge_interval_secs.max(1)),
            );
            store
        }
    };

    let rate_limiter = Arc::new(RateLimiter::new(store, &settings.rate_limiting));
    info!("Rate limiter initialized");

    let state = AppState::new(rate_limiter, settings.rate_limiting.failure_policy);
    let server = HttpServer::bind(settings.server.listen_addr, state).await?;

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Periodically evict expired entries from the in-memory store.
fn spawn_purger(store: Arc<MemoryStore>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged = purged, remaining = store.len(), "Purged expired counters");
            }
        }
    });
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
