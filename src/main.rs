// =============================================================================
// DROP SERVICE - Main Entry Point
// =============================================================================
// Group-buy drop service.
//
// WHAT THIS SERVICE DOES:
// - Runs the drop lifecycle (approval, activation, close/expiry)
// - Takes reservations backed by payment holds and escalates the
//   drop's discount as committed value grows
// - Settles completed drops by capturing every hold at the final
//   discount
// - Tracks return-based user reputation and suspensions
// - Exposes Prometheus metrics and caches hot drop reads in Redis
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod config; // Environment configuration (config.rs)
mod db; // Database operations (db.rs)
mod discount; // Discount escalation curve (discount.rs)
mod error; // Error types (error.rs)
mod handlers; // HTTP request handlers (handlers.rs)
mod lifecycle; // Drop state machine (lifecycle.rs)
mod metrics; // Prometheus metrics setup (metrics.rs)
mod models; // Data structures (models.rs)
mod notify; // User notification fan-out (notify.rs)
mod payment; // Payment gateway client (payment.rs)
mod reputation; // Return-based reputation (reputation.rs)
mod reserve; // Reservation saga (reserve.rs)
mod scheduler; // Background clock loop (scheduler.rs)
mod settlement; // Settlement engine (settlement.rs)
mod transitions; // Lifecycle orchestration (transitions.rs)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::metrics::setup_metrics;
use crate::notify::Notifier;
use crate::payment::{HttpPaymentGateway, PaymentGateway};
use crate::scheduler::Scheduler;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: Database,

    /// Redis connection for the drop cache and notification publishes
    pub redis: redis::aio::ConnectionManager,

    /// Notification fan-out (wraps the same Redis connection)
    pub notifier: Notifier,

    /// Payment processor client, behind the gateway trait so tests can
    /// swap in a mock
    pub gateway: Arc<dyn PaymentGateway>,

    /// Prometheus metrics handle
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    /// Parsed configuration
    pub config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ----- Step 1: environment -----
    dotenvy::dotenv().ok();

    // ----- Step 2: structured logging -----
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,drop_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Drop Service...");

    // ----- Step 3: configuration -----
    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    // ----- Step 4: metrics -----
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // ----- Step 5: PostgreSQL -----
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // ----- Step 6: Redis -----
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    let notifier = Notifier::new(redis_conn.clone());

    // ----- Step 7: payment gateway -----
    let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpPaymentGateway::new(
        config.payment_gateway_url.clone(),
        config.payment_timeout,
    )?);
    info!(url = %config.payment_gateway_url, "Payment gateway client ready");

    // ----- Step 8: background scheduler -----
    let scheduler = Scheduler {
        db: db.clone(),
        redis: redis_conn.clone(),
        gateway: gateway.clone(),
        notifier: notifier.clone(),
        payment_timeout: config.payment_timeout,
        drop_duration: config.drop_duration,
        interval: config.scheduler_interval,
    };
    tokio::spawn(scheduler.run());
    info!(
        interval_secs = config.scheduler_interval.as_secs(),
        "Scheduler started"
    );

    // ----- Step 9: application state -----
    let state = Arc::new(AppState {
        db,
        redis: redis_conn,
        notifier,
        gateway,
        metrics_handle,
        config: config.clone(),
    });

    // ----- Step 10: routes -----
    let app = Router::new()
        // Health & readiness
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // Prometheus scrape target
        .route("/metrics", get(handlers::metrics_handler))
        // Drops
        .route(
            "/api/v1/drops",
            get(handlers::list_drops).post(handlers::create_drop),
        )
        .route("/api/v1/drops/:id", get(handlers::get_drop))
        .route("/api/v1/drops/:id/transition", post(handlers::transition_drop))
        .route("/api/v1/drops/:id/settlement", get(handlers::get_settlement))
        // Reservations
        .route("/api/v1/reservations", post(handlers::create_reservation))
        .route("/api/v1/reservations/:id", get(handlers::get_reservation))
        .route(
            "/api/v1/reservations/:id/cancel",
            post(handlers::cancel_reservation),
        )
        // Reputation
        .route("/api/v1/returns", post(handlers::record_return))
        .route(
            "/api/v1/users/:id/reputation",
            get(handlers::get_reputation),
        )
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // ----- Step 11: serve -----
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Drop Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
