//! Request Metrics Middleware
//!
//! Feeds every request's latency and outcome into the metrics
//! aggregator. Purely observational; never alters the response.

use std::time::Instant;

use axum::{extract::State, middleware::Next, response::Response};

use crate::AppState;

pub async fn track_requests(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;

    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    let is_error = response.status().is_server_error();
    state.metrics.record_request(duration_ms, is_error).await;

    response
}
