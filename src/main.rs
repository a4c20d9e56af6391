use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use solegate::config::{GateConfig, MemoryStoreConfig, RateLimitingConfig, StoreConfig};
use solegate::http::GateServer;
use solegate::ratelimit::{CleanupTask, MemoryStore, RateLimiter, RateStore, RedisCounters, SharedCounterStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Sliding-window rate limiting gate for the sneaker social API.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Solegate rate limiting gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let limits = &config.rate_limiting;
    let (store, _cleanup) = build_store(limits).await?;
    let limiter = Arc::new(RateLimiter::from_config(store, limits)?);

    for rule in limiter.rules().iter() {
        info!(
            scope = %rule.name,
            max_requests = rule.max_requests,
            window = ?rule.window,
            count_only_failures = rule.count_only_failures,
            "Rate limit rule loaded"
        );
    }

    let server = GateServer::new(config.server.listen_addr, limiter)
        .trust_proxy_headers(limits.trust_proxy_headers);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Solegate stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
    }
}

/// Build the configured store, falling back to memory if Redis is unreachable.
async fn build_store(
    limits: &RateLimitingConfig,
) -> anyhow::Result<(Arc<dyn RateStore>, Option<CleanupTask>)> {
    match &limits.store {
        StoreConfig::Memory(memory) => Ok(memory_store(memory)),
        StoreConfig::Redis(redis) => {
            match RedisCounters::connect(&redis.url, redis.key_prefix.clone(), redis.connect_timeout()).await {
                Ok(counters) => {
                    let store: Arc<dyn RateStore> = Arc::new(SharedCounterStore::new(counters));
                    Ok((store, None))
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, falling back to in-memory rate limiting");
                    Ok(memory_store(&limits.fallback_memory_store()?))
                }
            }
        }
    }
}

fn memory_store(config: &MemoryStoreConfig) -> (Arc<dyn RateStore>, Option<CleanupTask>) {
    let memory = Arc::new(MemoryStore::new());
    let cleanup = memory.spawn_cleanup(config.cleanup_interval(), config.stale_after());
    info!(
        cleanup_interval = ?config.cleanup_interval(),
        stale_after = ?config.stale_after(),
        "Using in-memory rate limit store"
    );
    let store: Arc<dyn RateStore> = memory;
    (store, Some(cleanup))
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
