//! Directory Listing Handlers
//!
//! Thin read surface over the consolidated `places` table. Listings go
//! through the query pipeline with result caching; writes invalidate the
//! `places` tag across every cache tier.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::{
    errors::AppError,
    extractors::AuthUser,
    responses::{ApiResponse, PaginatedResponse},
    AppState,
};

/// Cache tag shared by every listing query.
const PLACES_TAG: &str = "places";

const LISTING_CATEGORIES: &[&str] = &["restaurant", "synagogue", "mikvah", "store", "marketplace"];

#[derive(Debug, Deserialize)]
pub struct ListPlacesQuery {
    pub category: Option<String>,
    pub city: Option<String>,
    pub search: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    20
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePlaceRequest {
    #[validate(length(min = 1, max = 255, message = "Name is required"))]
    pub name: String,
    pub category: String,
    pub kosher_cert: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
}

/// GET /api/places
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListPlacesQuery>,
) -> Result<Json<PaginatedResponse<Value>>, AppError> {
    if let Some(category) = &params.category {
        if !LISTING_CATEGORIES.contains(&category.as_str()) {
            return Err(AppError::ValidationMessage(format!(
                "Unknown category '{category}'"
            )));
        }
    }

    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);

    let mut conditions = vec!["is_active = TRUE".to_string()];
    let mut bind_params: Vec<Value> = Vec::new();
    if let Some(category) = &params.category {
        bind_params.push(json!(category));
        conditions.push(format!("category = ${}", bind_params.len()));
    }
    if let Some(city) = &params.city {
        bind_params.push(json!(city));
        conditions.push(format!("city = ${}", bind_params.len()));
    }
    if let Some(search) = &params.search {
        bind_params.push(json!(format!("%{search}%")));
        conditions.push(format!("name ILIKE ${}", bind_params.len()));
    }
    let where_clause = conditions.join(" AND ");

    let count_sql = format!("SELECT COUNT(*) AS total FROM places WHERE {where_clause}");
    let total = state
        .db
        .execute_query(&count_sql, &bind_params, true, None)
        .await?
        .first()
        .and_then(|row| row.get("total"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    bind_params.push(json!(per_page));
    let limit_pos = bind_params.len();
    bind_params.push(json!((page - 1) * per_page));
    let offset_pos = bind_params.len();
    let list_sql = format!(
        "SELECT id, name, category, kosher_cert, address, city, state, phone, website,
                latitude, longitude, created_at, updated_at
         FROM places WHERE {where_clause}
         ORDER BY name
         LIMIT ${limit_pos} OFFSET ${offset_pos}"
    );
    let rows = state
        .db
        .execute_query(&list_sql, &bind_params, true, None)
        .await?;

    Ok(Json(PaginatedResponse::new(rows, total, page, per_page)))
}

/// GET /api/places/{id}
#[tracing::instrument(skip(state))]
pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let rows = state
        .db
        .execute_query(
            "SELECT id, name, category, kosher_cert, address, city, state, phone, website,
                    latitude, longitude, created_at, updated_at
             FROM places WHERE id = $1 AND is_active = TRUE",
            &[json!(id)],
            true,
            None,
        )
        .await?;

    let place = rows
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound("Listing not found".to_string()))?;
    Ok(Json(ApiResponse::success(place)))
}

/// POST /api/admin/places
#[tracing::instrument(skip(state, _admin, payload))]
pub async fn create(
    State(state): State<AppState>,
    _admin: AuthUser,
    Json(payload): Json<CreatePlaceRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Value>>), AppError> {
    payload.validate()?;
    if !LISTING_CATEGORIES.contains(&payload.category.as_str()) {
        return Err(AppError::ValidationMessage(format!(
            "Unknown category '{}'",
            payload.category
        )));
    }

    state
        .db
        .execute_query(
            "INSERT INTO places (name, category, kosher_cert, address, city, state, phone, website)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                json!(payload.name),
                json!(payload.category),
                json!(payload.kosher_cert),
                json!(payload.address),
                json!(payload.city),
                json!(payload.state),
                json!(payload.phone),
                json!(payload.website),
            ],
            false,
            None,
        )
        .await?;

    // A write crosses the listings domain: drop cached query results and
    // every tier entry tagged with it.
    state.db.invalidate_cache(None).await;
    state
        .cache
        .invalidate_by_tags(&[PLACES_TAG.to_string()])
        .await;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(json!({ "created": true }))),
    ))
}
