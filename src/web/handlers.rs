use axum::{
    extract::{FromRef, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::application::usage_tracker::UsageTracker;
use crate::domain::rate_limit::RateLimitStats;
use crate::domain::usage::{ResourceType, UsageRecord};
use crate::infrastructure::{
    auth::{AuthenticatedUser, JwtAuthenticator, UserRole},
    rate_limiter::RateLimiter,
};
use crate::web::error::ApiError;

/// Everything the handlers share. Built once per process.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub rate_limiter: RateLimiter,
    pub usage_tracker: Arc<UsageTracker>,
    pub authenticator: Arc<JwtAuthenticator>,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub resource_type: Option<ResourceType>,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub usage: Vec<UsageRecord>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TrackUsageRequest {
    pub resource_type: ResourceType,
    #[validate(range(min = 1, message = "count must be at least 1"))]
    pub count: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct UsageLimitQuery {
    pub resource_type: ResourceType,
    pub limit: i64,
}

#[derive(Debug, Serialize)]
pub struct UsageLimitResponse {
    pub allowed: bool,
    pub current_usage: i64,
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRateLimitRequest {
    pub rule_key: String,
    /// Client identity to reset. Defaults to the caller.
    pub client: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetRateLimitResponse {
    pub success: bool,
    pub existed: bool,
}

pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

pub async fn get_usage(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<UsageQuery>,
) -> Json<UsageResponse> {
    let usage = state
        .usage_tracker
        .get_user_usage(user.user_id, query.resource_type)
        .await;
    Json(UsageResponse { usage })
}

pub async fn track_usage(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<TrackUsageRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    payload.validate()?;

    state
        .usage_tracker
        .track_usage(user.user_id, payload.resource_type, payload.count.unwrap_or(1))
        .await;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn check_usage_limit(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<UsageLimitQuery>,
) -> Json<UsageLimitResponse> {
    let tracker = &state.usage_tracker;
    let current_usage = tracker.current_usage(user.user_id, query.resource_type).await;
    let allowed = tracker
        .check_usage_limit(user.user_id, query.resource_type, query.limit)
        .await;

    Json(UsageLimitResponse {
        allowed,
        current_usage,
        limit: query.limit,
    })
}

pub async fn rate_limit_stats(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<RateLimitStats>, ApiError> {
    user.require_role(UserRole::Admin)?;
    Ok(Json(state.rate_limiter.get_stats()))
}

pub async fn reset_rate_limit(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: HeaderMap,
    Json(payload): Json<ResetRateLimitRequest>,
) -> Result<Json<ResetRateLimitResponse>, ApiError> {
    user.require_role(UserRole::Admin)?;

    let existed = match payload.client.as_deref() {
        Some(client) => state.rate_limiter.reset_identity(client, &payload.rule_key),
        None => state.rate_limiter.reset_client(&headers, &payload.rule_key),
    };
    info!(
        admin = %user.user_id,
        rule_key = %payload.rule_key,
        existed,
        "Rate limit reset requested"
    );

    Ok(Json(ResetRateLimitResponse {
        success: true,
        existed,
    }))
}
