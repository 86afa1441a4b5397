//! API Route Definitions

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::{handlers, middleware as app_middleware, AppState};

/// Build all API routes
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        // Health check endpoints (no auth)
        .nest("/api/health", health_routes())
        // Public directory listings (no auth)
        .nest("/api/places", directory_routes())
        // Auth routes (no auth required)
        .nest("/api/auth", auth_routes(state.clone()))
        // Protected routes (auth required)
        .nest("/api", protected_routes(state.clone()))
        // Admin routes (auth + admin role)
        .nest("/api/admin", admin_routes(state.clone()))
        // Key discovery
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
        // Request latency/error accounting
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::metrics::track_requests,
        ))
        .with_state(state)
}

/// Health check routes (Kubernetes probes + metrics pulls)
fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/live", get(handlers::health::liveness))
        .route("/ready", get(handlers::health::readiness))
        .route("/db", get(handlers::health::db_health))
        .route("/performance", get(handlers::health::performance))
        .route("/cache", get(handlers::health::cache_metrics))
        .route("/metrics", get(handlers::health::metrics))
        .route("/optimization", get(handlers::health::optimization))
}

/// Public directory listings
fn directory_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::directory::list))
        .route("/{id}", get(handlers::directory::show))
}

/// Authentication routes
fn auth_routes(state: AppState) -> Router<AppState> {
    // Credential endpoints carry per-IP rate limiting.
    let rate_limited = Router::new()
        .route("/register", post(handlers::auth::register))
        .route("/login", post(handlers::auth::login))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::rate_limit::rate_limit_login,
        ));

    let authenticated = Router::new()
        .route("/change-password", post(handlers::auth::change_password))
        .route("/upgrade", post(handlers::auth::upgrade_guest))
        .route("/sessions", get(handlers::sessions::list))
        .route("/sessions/{sid}", delete(handlers::sessions::revoke))
        .route("/sessions/revoke-all", post(handlers::sessions::revoke_all))
        .route(
            "/step-up/challenge",
            post(handlers::auth::create_step_up_challenge),
        )
        .route(
            "/step-up/{challenge_id}",
            get(handlers::auth::get_step_up_challenge),
        )
        .route(
            "/step-up/{challenge_id}/password",
            post(handlers::auth::verify_step_up_password),
        )
        .route(
            "/step-up/{challenge_id}/complete",
            post(handlers::auth::complete_step_up_challenge),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth::require_auth,
        ));

    Router::new()
        .merge(rate_limited)
        .merge(authenticated)
        .route("/guest", post(handlers::auth::guest))
        .route("/logout", post(handlers::auth::logout))
        .route("/refresh", post(handlers::auth::refresh_token))
        .route("/forgot-password", post(handlers::auth::forgot_password))
        .route("/reset-password", post(handlers::auth::reset_password))
        .route("/verify-email/{token}", get(handlers::auth::verify_email))
        .with_state(state)
}

/// Protected routes (require authentication)
fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/me", get(handlers::me::show))
        .route("/me", put(handlers::me::update))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth::require_auth,
        ))
        .with_state(state)
}

/// Admin routes (require admin role)
fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/users/{id}/roles", get(handlers::admin::list_roles))
        .route("/users/{id}/roles", post(handlers::admin::assign_role))
        .route("/users/{id}/roles", delete(handlers::admin::revoke_role))
        .route("/cache/invalidate", post(handlers::admin::invalidate_cache))
        .route("/cache/cleanup", post(handlers::admin::cleanup_cache))
        .route("/cache/warm", post(handlers::admin::warm_cache))
        .route("/places", post(handlers::directory::create))
        .layer(middleware::from_fn(app_middleware::auth::require_admin))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth::require_auth,
        ))
        .with_state(state)
}
