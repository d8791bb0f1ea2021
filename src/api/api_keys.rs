/// API-key lifecycle endpoints
use super::middleware::{gate, with_rate_headers};
use crate::auth::Principal;
use crate::context::AppContext;
use crate::db::models::{ApiKey, Environment};
use crate::error::{ApiError, ApiResult};
use crate::gate::plans;
use crate::keys::IssueKeyParams;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api-keys", post(create_key).get(list_keys))
        .route("/api-keys/:id", get(get_key).delete(delete_key))
        .route("/api-keys/:id/rotate", post(rotate_key))
        .route("/api-keys/:id/revoke", post(revoke_key))
        .route("/api-keys/:id/usage", get(key_usage))
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default = "default_environment")]
    environment: Environment,
    expires_in_days: Option<i64>,
    #[serde(default = "default_per_minute")]
    limit_per_minute: i64,
    #[serde(default = "default_per_hour")]
    limit_per_hour: i64,
    #[serde(default = "default_per_day")]
    limit_per_day: i64,
    ip_allowlist: Option<Vec<String>>,
}

fn default_environment() -> Environment {
    Environment::Production
}
fn default_per_minute() -> i64 {
    60
}
fn default_per_hour() -> i64 {
    1_000
}
fn default_per_day() -> i64 {
    10_000
}

/// Redacted representation; all reads after creation get this shape.
#[derive(Debug, Serialize)]
struct KeyResponse {
    id: Uuid,
    name: String,
    key: String,
    scopes: Vec<String>,
    environment: Environment,
    limit_per_minute: i64,
    limit_per_hour: i64,
    limit_per_day: i64,
    total_requests: i64,
    is_active: bool,
    last_used_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl KeyResponse {
    fn redacted(key: &ApiKey) -> Self {
        Self {
            id: key.id,
            name: key.name.clone(),
            key: key.redacted_key(),
            scopes: key.scopes.clone(),
            environment: key.environment,
            limit_per_minute: key.limit_per_minute,
            limit_per_hour: key.limit_per_hour,
            limit_per_day: key.limit_per_day,
            total_requests: key.total_requests,
            is_active: key.is_active,
            last_used_at: key.last_used_at,
            expires_at: key.expires_at,
            revoked_at: key.revoked_at,
            created_at: key.created_at,
        }
    }
}

/// Creation response; the only place the full secret ever appears.
#[derive(Debug, Serialize)]
struct KeyWithSecret {
    #[serde(flatten)]
    key: KeyResponse,
    api_key: String,
}

async fn create_key(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<CreateKeyRequest>,
) -> ApiResult<(StatusCode, Json<KeyWithSecret>)> {
    gate(&ctx, &principal, &plans::KEYS_MANAGE).await?;

    if body.limit_per_minute < 1 || body.limit_per_hour < 1 || body.limit_per_day < 1 {
        return Err(ApiError::Validation("Rate limits must be positive".to_string()));
    }
    if let Some(days) = body.expires_in_days {
        if !(1..=365).contains(&days) {
            return Err(ApiError::Validation(
                "expires_in_days must be between 1 and 365".to_string(),
            ));
        }
    }

    let (key, secret) = ctx
        .keys
        .issue(
            principal.user_id,
            principal.org_id,
            IssueKeyParams {
                name: body.name,
                scopes: body.scopes,
                environment: body.environment,
                expires_in_days: body.expires_in_days,
                limit_per_minute: body.limit_per_minute,
                limit_per_hour: body.limit_per_hour,
                limit_per_day: body.limit_per_day,
                ip_allowlist: body.ip_allowlist,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(KeyWithSecret { key: KeyResponse::redacted(&key), api_key: secret }),
    ))
}

async fn list_keys(
    State(ctx): State<AppContext>,
    principal: Principal,
) -> ApiResult<Json<Vec<KeyResponse>>> {
    gate(&ctx, &principal, &plans::KEYS_MANAGE).await?;

    let keys = ctx.repo.list_api_keys(principal.user_id).await?;
    Ok(Json(keys.iter().map(KeyResponse::redacted).collect()))
}

async fn get_key(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<KeyResponse>> {
    gate(&ctx, &principal, &plans::KEYS_MANAGE).await?;

    let key = ctx.repo.get_api_key(key_id, principal.user_id).await?;
    Ok(Json(KeyResponse::redacted(&key)))
}

#[derive(Debug, Serialize)]
struct RotateResponse {
    #[serde(flatten)]
    key: KeyResponse,
    api_key: String,
    rotated_from: Uuid,
    old_key_valid_until: DateTime<Utc>,
}

async fn rotate_key(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<RotateResponse>> {
    gate(&ctx, &principal, &plans::KEYS_MANAGE).await?;

    let (new_key, secret, old_id) = ctx.keys.rotate(key_id, principal.user_id).await?;
    let old_key = ctx.repo.get_api_key(old_id, principal.user_id).await?;

    Ok(Json(RotateResponse {
        key: KeyResponse::redacted(&new_key),
        api_key: secret,
        rotated_from: old_id,
        old_key_valid_until: old_key.revoked_at.unwrap_or_else(|| ctx.clock.now()),
    }))
}

async fn revoke_key(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<KeyResponse>> {
    gate(&ctx, &principal, &plans::KEYS_MANAGE).await?;

    ctx.keys.revoke(key_id, principal.user_id).await?;
    let key = ctx.repo.get_api_key(key_id, principal.user_id).await?;
    Ok(Json(KeyResponse::redacted(&key)))
}

async fn delete_key(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(key_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    gate(&ctx, &principal, &plans::KEYS_MANAGE).await?;

    ctx.keys.delete(key_id, principal.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default = "default_usage_days")]
    days: i64,
}

fn default_usage_days() -> i64 {
    7
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    api_key_id: Uuid,
    total_requests: i64,
    successful_requests: i64,
    failed_requests: i64,
    avg_response_time_ms: f64,
    requests_by_endpoint: Vec<EndpointCount>,
    period_days: i64,
}

#[derive(Debug, Serialize)]
struct EndpointCount {
    endpoint: String,
    count: i64,
}

/// Plan-gated usage analytics.
async fn key_usage(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(key_id): Path<Uuid>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::KEYS_USAGE).await?;

    let stats = ctx.keys.usage(key_id, principal.user_id, query.days).await?;

    Ok(with_rate_headers(
        info,
        Json(UsageResponse {
            api_key_id: key_id,
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            avg_response_time_ms: stats.avg_response_time_ms,
            requests_by_endpoint: stats
                .requests_by_endpoint
                .into_iter()
                .map(|(endpoint, count)| EndpointCount { endpoint, count })
                .collect(),
            period_days: query.days,
        }),
    ))
}
