//! Well-Known Documents

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::AppState;

/// GET /.well-known/jwks.json - the key set as currently known, with
/// cache-control so verifiers do not hammer the endpoint.
pub async fn jwks(State(state): State<AppState>) -> Response {
    let document = match &state.jwks {
        Some(registry) => registry.document().await,
        None => json!({ "keys": [] }),
    };
    (
        [(header::CACHE_CONTROL, "public, max-age=3600, must-revalidate")],
        Json(document),
    )
        .into_response()
}
