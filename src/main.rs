//! Kehilla Directory - Rust/Axum API
//!
//! # Architecture
//! - Axum 0.8 web framework
//! - SQLx connection pool with server-side statement timeouts
//! - Three-tier cache: in-process LRU, Redis, durable Postgres KV
//! - JWT authentication with rotating refresh-token families
//! - Redis-backed token blacklist and step-up challenges

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, Router};
use tokio::net::TcpListener;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kehilla_directory_api::{
    auth::{jwks::JwksRegistry, AuthService},
    cache::{manager::WarmingFuture, CacheManager, RedisClient},
    config::AppConfig,
    database::{self, DatabaseManager, HealthMonitor, QueryCache},
    middleware::rate_limit::LoginRateLimiter,
    monitoring::MetricsAggregator,
    routes,
    services::Mailer,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Kehilla Directory API");

    // Load configuration; a missing required option fails here, loudly.
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    tracing::info!(
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    // Connection pool with server-side timeouts on every connection.
    let (pool, connect_counter) = database::manager::build_pool(&config.database).await?;
    tracing::info!("Database connection pool established");

    match sqlx::migrate!("./migrations").run(&pool).await {
        Ok(_) => tracing::info!("Database migrations completed"),
        Err(e) => {
            tracing::warn!("Migration check failed: {}. Continuing with existing schema.", e);
        }
    }

    // Redis is optional; every consumer degrades without it.
    let redis = match RedisClient::connect(&config.redis.effective_url(), "kehilla:").await {
        Ok(client) => {
            tracing::info!("Redis connection established");
            Some(client)
        }
        Err(e) => {
            tracing::warn!("Redis connection failed: {}, continuing without cache", e);
            None
        }
    };

    // Multi-tier cache manager.
    let cache = Arc::new(CacheManager::new(
        config.cache.l1_max_entries,
        config.cache.l1_max_memory_mb,
        redis.as_ref(),
        pool.clone(),
    ));
    cache.initialize().await?;

    // Query cache routed through the tier manager.
    let query_cache = Arc::new(QueryCache::new(
        cache.clone(),
        config.cache.query_ttl_secs,
        config.cache.max_memory_entries,
    ));

    // Consolidated database manager.
    let db = Arc::new(DatabaseManager::new(
        pool.clone(),
        connect_counter,
        config.database.clone(),
        config.cache.slow_query_threshold_secs,
        query_cache,
    ));
    db.connect().await?;

    // Mailer is best-effort; a broken SMTP config only disables email.
    let mailer = match Mailer::new(&config.email) {
        Ok(mailer) => Some(Arc::new(mailer)),
        Err(e) => {
            tracing::warn!("Mailer unavailable: {}", e);
            None
        }
    };

    // Authentication service.
    let auth = Arc::new(AuthService::new(
        pool.clone(),
        redis.as_ref(),
        mailer,
        config.auth.clone(),
        config.jwt.clone(),
        config.effective_bcrypt_rounds(),
    ));

    // Warming strategy: preload active directory listings into the tiers.
    {
        let warm_db = db.clone();
        let warm_cache = cache.clone();
        cache
            .register_warming_strategy(
                "places",
                Arc::new(move |_args: serde_json::Value| -> WarmingFuture {
                    let db = warm_db.clone();
                    let cache = warm_cache.clone();
                    Box::pin(async move {
                        let rows = db
                            .execute_query(
                                "SELECT id, name, category, kosher_cert, city, state
                                 FROM places WHERE is_active = TRUE",
                                &[],
                                false,
                                None,
                            )
                            .await
                            .map_err(|e| e.to_string())?;
                        let loaded = rows.len() as u64;
                        for row in rows {
                            let Some(id) = row.get("id").and_then(serde_json::Value::as_i64)
                            else {
                                continue;
                            };
                            cache
                                .set(&format!("place:{id}"), row, None, &["places".to_string()])
                                .await;
                        }
                        Ok(loaded)
                    })
                }),
            )
            .await;
    }

    // Observers.
    let health = Arc::new(HealthMonitor::new(config.health.clone()));
    let metrics = Arc::new(MetricsAggregator::new().with_default_alerts().await);
    let jwks = config
        .jwt
        .jwks_url
        .as_ref()
        .map(|url| Arc::new(JwksRegistry::new(url.clone())));

    let state = AppState {
        db: db.clone(),
        cache: cache.clone(),
        auth: auth.clone(),
        health: health.clone(),
        metrics: metrics.clone(),
        redis,
        jwks,
        rate_limiter: Arc::new(LoginRateLimiter::default()),
        config: Arc::new(config.clone()),
    };

    // Background tasks, all stopped by one shutdown signal.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let health_task = health.clone().spawn(db.clone(), shutdown_rx.clone());
    let maintenance_task = spawn_maintenance(state.clone(), shutdown_rx.clone());
    let alerts_task = spawn_alert_checker(state.clone(), shutdown_rx);

    // Build application router
    let app = Router::new()
        .merge(routes::api_routes(state))
        // Request ID propagation
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        // Compression
        .layer(CompressionLayer::new())
        // Timeout
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        // CORS
        .layer(build_cors_layer(&config))
        // Tracing
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop background tasks and drain.
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(health_task, maintenance_task, alerts_task);
    db.disconnect().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Hourly sweep: expired durable-cache rows and stale session rows.
fn spawn_maintenance(
    state: AppState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = state.cache.cleanup_expired().await;
                    if removed.total() > 0 {
                        tracing::info!(removed = removed.total(), "expired cache entries purged");
                    }
                    match state.auth.session_store().cleanup_expired().await {
                        Ok(n) if n > 0 => tracing::info!(removed = n, "stale session rows purged"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "session cleanup failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Alert evaluation loop: feeds derived cache and database gauges into
/// the aggregator, then checks thresholds.
fn spawn_alert_checker(
    state: AppState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cache = state.cache.metrics().await;
                    if cache.total_operations > 0 {
                        state.metrics
                            .record("cache_hit_rate_percent", cache.overall_hit_rate_percent)
                            .await;
                    }
                    let db = state.db.stats();
                    state.metrics.record("slow_query_count", db.slow_queries as f64).await;
                    state.metrics.record("db_query_time_ms", db.avg_response_time_ms).await;
                    state.metrics
                        .record("active_connections", state.db.pool_state().checked_out as f64)
                        .await;

                    state.metrics.check_alerts().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Build CORS layer from configuration
fn build_cors_layer(config: &AppConfig) -> CorsLayer {
    use axum::http::{header, HeaderName, Method};

    let origins: Vec<_> = config
        .cors
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    tracing::info!("CORS allowed origins: {:?}", config.cors.allowed_origins);

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
            Method::HEAD,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            header::CACHE_CONTROL,
            HeaderName::from_static("x-requested-with"),
            HeaderName::from_static("x-csrf-token"),
        ])
        .expose_headers([
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            HeaderName::from_static("x-request-id"),
        ])
        .allow_credentials(true)
        .max_age(Duration::from_secs(config.cors.max_age))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
