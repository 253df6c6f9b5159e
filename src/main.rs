// =============================================================================
// ADEGA STOCK SERVICE - Main Entry Point
// =============================================================================
// Stock reconciliation service for the Adega store back office.
//
// WHAT THIS SERVICE DOES:
// - Validates stock adjustment intents (entrada / saída / ajuste) and submits
//   each one exactly once to the backend's stock procedure, along with
//   absolute corrections and transfers to the store 2 holding area
// - Drops every cached view of a product after its stock changed, then
//   refetches the product detail in the background
// - Serves cached product, movement, low-stock and aggregate reads
// - Exposes Prometheus metrics and JSON logs
// =============================================================================

mod adjustment; // Adjustment request builder and submitter
mod auth; // Session extraction from bearer tokens
mod cache; // Read-through cache and invalidation coordinator
mod config; // Configuration loading
mod db; // PostgreSQL reads and procedure calls
mod error; // HTTP error type
mod feedback; // User-facing notices
mod handlers; // HTTP request handlers
mod low_stock; // Low-stock and aggregate computations
mod metrics; // Prometheus metrics setup
mod models; // Data structures

#[cfg(test)]
mod fake_ledger;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::adjustment::StockAdjuster;
use crate::auth::SessionVerifier;
use crate::cache::{
    CacheHandle, InvalidationCoordinator, MemoryQueryCache, QueryCache, RedisQueryCache,
};
use crate::config::Config;
use crate::db::Database;
use crate::metrics::setup_metrics;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every handler through State<Arc<AppState>>. The adjuster and the
// coordinator hold the same database and cache handles as the read path.
pub struct AppState {
    pub db: Arc<Database>,

    pub cache: CacheHandle,

    /// Sole path to the stock procedures
    pub adjuster: StockAdjuster,

    pub coordinator: InvalidationCoordinator,

    pub sessions: SessionVerifier,

    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG controls levels, e.g. RUST_LOG=info,adega_stock_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,adega_stock_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Adega Stock Service...");

    let config = Config::from_env()?;
    info!(
        port = config.port,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "Configuration loaded"
    );

    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    let db = Arc::new(Database::connect(&config.database_url).await?);
    info!("Connected to PostgreSQL");

    let store: Arc<dyn QueryCache> = match &config.redis_url {
        Some(url) => {
            let redis = RedisQueryCache::connect(url).await?;
            info!("Connected to Redis");
            Arc::new(redis)
        }
        None => {
            warn!("REDIS_URL not set, using in-process cache");
            Arc::new(MemoryQueryCache::new())
        }
    };

    let cache = CacheHandle::new(store, config.cache_ttl);

    let state = Arc::new(AppState {
        adjuster: StockAdjuster::new(db.clone()),
        coordinator: InvalidationCoordinator::new(cache.clone(), db.clone()),
        sessions: SessionVerifier::new(&config.jwt_secret, &config.jwt_audience),
        db,
        cache,
        metrics_handle,
    });

    let app = Router::new()
        // ----- Health & Metrics -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Products -----
        .route("/api/v1/products", get(handlers::list_products))
        .route("/api/v1/products/:id", get(handlers::get_product))
        .route("/api/v1/products/:id/variants", get(handlers::get_product_variants))
        // ----- Inventory -----
        .route("/api/v1/inventory/adjust", post(handlers::adjust_stock))
        .route("/api/v1/inventory/absolute", post(handlers::set_stock_absolute))
        .route("/api/v1/inventory/transfer", post(handlers::transfer_stock))
        .route("/api/v1/inventory/movements", get(handlers::list_movements))
        .route("/api/v1/inventory/alerts", get(handlers::low_stock_alerts))
        // ----- Aggregates -----
        .route("/api/v1/dashboard/inventory", get(handlers::inventory_dashboard))
        .route("/api/v1/reports/turnover", get(handlers::turnover_report))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Adega Stock Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
