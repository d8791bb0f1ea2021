/// Recommendation serving and feedback endpoints
use super::middleware::{gate, with_rate_headers};
use crate::auth::Principal;
use crate::context::AppContext;
use crate::engine::RecommendationKind;
use crate::error::ApiResult;
use crate::gate::plans;
use crate::ingest::FeedbackSignal;
use crate::recommend::RecommendRequest;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/recommendations", get(personal))
        .route("/recommendations/similar/:track_id", get(similar))
        .route("/ml/daily-mix", get(daily_mix))
        .route("/ml/radio", post(radio))
        .route("/ml/taste-profile", get(taste_profile))
        .route("/ml/recommendations/feedback", post(feedback))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    timeout_ms: Option<u64>,
}

fn default_limit() -> usize {
    20
}

async fn personal(
    State(ctx): State<AppContext>,
    principal: Principal,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::RECOMMENDATIONS).await?;
    let result = ctx
        .dispatcher
        .recommend(
            &principal,
            RecommendRequest {
                kind: RecommendationKind::UserPersonal,
                seed: None,
                limit: query.limit,
                timeout_ms: query.timeout_ms,
            },
        )
        .await?;
    Ok(with_rate_headers(info, Json(result)))
}

async fn similar(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(track_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::SIMILAR_TRACKS).await?;
    let result = ctx
        .dispatcher
        .recommend(
            &principal,
            RecommendRequest {
                kind: RecommendationKind::SimilarToTrack,
                seed: Some(track_id),
                limit: query.limit,
                timeout_ms: query.timeout_ms,
            },
        )
        .await?;
    Ok(with_rate_headers(info, Json(result)))
}

#[derive(Debug, Deserialize)]
struct DailyMixQuery {
    #[serde(default = "default_mix_limit")]
    limit: usize,
    timeout_ms: Option<u64>,
}

fn default_mix_limit() -> usize {
    50
}

/// Starter+.
async fn daily_mix(
    State(ctx): State<AppContext>,
    principal: Principal,
    Query(query): Query<DailyMixQuery>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::DAILY_MIX).await?;
    let result = ctx
        .dispatcher
        .recommend(
            &principal,
            RecommendRequest {
                kind: RecommendationKind::DailyMix,
                seed: None,
                limit: query.limit,
                timeout_ms: query.timeout_ms,
            },
        )
        .await?;
    Ok(with_rate_headers(info, Json(result)))
}

#[derive(Debug, Deserialize)]
struct RadioRequest {
    seed: Uuid,
    #[serde(default = "default_mix_limit")]
    limit: usize,
    timeout_ms: Option<u64>,
}

/// Starter+.
async fn radio(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<RadioRequest>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::RADIO).await?;
    let result = ctx
        .dispatcher
        .recommend(
            &principal,
            RecommendRequest {
                kind: RecommendationKind::RadioSeed,
                seed: Some(body.seed),
                limit: body.limit,
                timeout_ms: body.timeout_ms,
            },
        )
        .await?;
    Ok(with_rate_headers(info, Json(result)))
}

#[derive(Debug, Deserialize)]
struct TasteProfileQuery {
    #[serde(default = "default_profile_limit")]
    limit: usize,
    timeout_ms: Option<u64>,
}

fn default_profile_limit() -> usize {
    25
}

/// Pro+.
async fn taste_profile(
    State(ctx): State<AppContext>,
    principal: Principal,
    Query(query): Query<TasteProfileQuery>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::TASTE_PROFILE).await?;
    let result = ctx
        .dispatcher
        .recommend(
            &principal,
            RecommendRequest {
                kind: RecommendationKind::TasteProfile,
                seed: None,
                limit: query.limit,
                timeout_ms: query.timeout_ms,
            },
        )
        .await?;
    Ok(with_rate_headers(info, Json(result)))
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    recommendation_id: Uuid,
    signal: FeedbackSignal,
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct FeedbackResponse {
    interaction_id: Uuid,
    recommendation_id: Uuid,
    signal: FeedbackSignal,
}

/// Never blocks on ML-side processing; the learner reads the interaction
/// log offline.
async fn feedback(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<FeedbackRequest>,
) -> ApiResult<(StatusCode, Response)> {
    let info = gate(&ctx, &principal, &plans::FEEDBACK).await?;

    let outcome = ctx
        .ingestor
        .record_feedback(&principal, body.recommendation_id, body.signal, body.reason)
        .await?;

    Ok((
        StatusCode::CREATED,
        with_rate_headers(
            info,
            Json(FeedbackResponse {
                interaction_id: outcome.id,
                recommendation_id: body.recommendation_id,
                signal: body.signal,
            }),
        ),
    ))
}
