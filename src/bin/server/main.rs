//! tsgate HTTP server
//!
//! Exposes an OpenTSDB-compatible JSON API over a TimescaleDB instance.
//!
//! # Endpoints
//!
//! - `POST /api/put` - write data points
//! - `POST /api/query` - streamed range queries
//! - `POST /api/query/last` - latest point per series
//! - `POST /api/search/lookup` - series lookup
//! - `GET /api/suggest` - metric/tagk/tagv suggestions
//! - `GET /api/suggest/tagKeys/{metric}`, `GET /api/suggest/tagValues/{tagKey}`
//! - `GET /api/health` - 503 when the tagset cache goes stale
//!
//! Configuration comes from environment variables (`TIMESCALE_*`,
//! `DATA_RETENTION_DAYS`, worker intervals and timeouts, ingest cache sizes).

mod handlers;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use tsgate::cache::TagsetCache;
use tsgate::config::Config;
use tsgate::ingest::Ingestor;
use tsgate::query::QueryEngine;
use tsgate::services::{
    Housekeeper, HousekeepingService, ServiceManager, TagsetRefreshService,
};

use handlers::AppState;

// =============================================================================
// Router and server setup
// =============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/put", post(handlers::put))
        .route("/api/query", post(handlers::query))
        .route("/api/query/last", post(handlers::query_last))
        .route("/api/search/lookup", post(handlers::search_lookup))
        .route("/api/suggest", get(handlers::suggest))
        .route("/api/suggest/tagKeys/:metric", get(handlers::suggest_tag_keys))
        .route(
            "/api/suggest/tagValues/:tag_key",
            get(handlers::suggest_tag_values),
        )
        .route("/api/health", get(handlers::health))
        .with_state(state)
        .layer(cors)
}

/// Resolve on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// =============================================================================
// Main entry point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = Config::from_env()?;
    info!(
        "Starting tsgate v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.http.host,
        config.http.port
    );

    let pool = tsgate::db::connect(&config.timescale).await?;
    tsgate::db::migrate(&pool, config.data_retention_days).await?;
    tsgate::db::health_check(&pool).await?;
    info!("Database ready");

    let cache = Arc::new(TagsetCache::new(pool.clone()));
    // Warm the cache before taking traffic; a failure here is not fatal, the
    // refresh worker retries on its interval.
    match cache.refresh().await {
        Ok(stats) => info!(
            tagsets = stats.new_tagsets,
            series = stats.new_series,
            "Tagset cache warmed"
        ),
        Err(e) => warn!(error = %e, "Initial tagset cache refresh failed"),
    }

    let ingestor = Arc::new(Ingestor::new(
        pool.clone(),
        config.insert_metric_cache_size,
        config.insert_tagset_cache_size,
        config.cache_entry_ttl(),
    ));
    let engine = Arc::new(QueryEngine::new(pool.clone(), cache.clone()));

    let manager = ServiceManager::new(Duration::from_secs(30));
    manager.register(Arc::new(TagsetRefreshService::new(
        cache.clone(),
        config.tagset_cache_update_interval(),
        config.tagset_cache_update_timeout(),
    )))?;
    manager.register(Arc::new(HousekeepingService::new(
        Housekeeper::new(pool.clone(), cache.clone(), config.data_retention()),
        config.housekeeping_interval(),
        config.housekeeping_timeout(),
    )))?;
    manager.start_all();

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let state = Arc::new(AppState {
        config,
        pool,
        cache,
        ingestor,
        engine,
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("Goodbye");
    Ok(())
}
