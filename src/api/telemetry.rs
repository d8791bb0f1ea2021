/// Telemetry ingestion: impressions, search, views, player events
use super::middleware::{gate, with_rate_headers};
use crate::auth::Principal;
use crate::context::AppContext;
use crate::db::models::Impression;
use crate::error::{ApiError, ApiResult};
use crate::gate::plans;
use crate::ingest::{ContentViewInput, PlayerEventInput, SearchQueryInput};
use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/impressions/recommendations", post(log_impressions))
        .route("/telemetry/search", post(log_search))
        .route("/telemetry/views", post(log_view))
        .route("/telemetry/player-events", post(log_player_event))
}

/// Client-side impression log: which tracks were actually shown, with
/// optional parallel score/reason arrays.
#[derive(Debug, Deserialize)]
struct ImpressionLogRequest {
    track_ids: Vec<Uuid>,
    model_type: String,
    model_version: Option<String>,
    context_type: Option<String>,
    scores: Option<Vec<f64>>,
    reasons: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ImpressionLogResponse {
    recommendation_id: Uuid,
    logged: usize,
}

async fn log_impressions(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<ImpressionLogRequest>,
) -> ApiResult<(StatusCode, Response)> {
    let info = gate(&ctx, &principal, &plans::TELEMETRY_WRITE).await?;

    if body.track_ids.is_empty() || body.track_ids.len() > 100 {
        return Err(ApiError::Validation(
            "track_ids must contain between 1 and 100 entries".to_string(),
        ));
    }
    for (name, len) in [
        ("scores", body.scores.as_ref().map(Vec::len)),
        ("reasons", body.reasons.as_ref().map(Vec::len)),
    ] {
        if let Some(len) = len {
            if len != body.track_ids.len() {
                return Err(ApiError::Validation(format!(
                    "{} must align with track_ids",
                    name
                )));
            }
        }
    }

    let recommendation_id = ctx.ids.mint();
    let now = ctx.clock.now();
    let impressions: Vec<Impression> = body
        .track_ids
        .iter()
        .enumerate()
        .map(|(index, track_id)| Impression {
            id: ctx.ids.mint(),
            user_id: principal.user_id,
            track_id: *track_id,
            recommendation_id,
            model_type: body.model_type.clone(),
            model_version: body.model_version.clone(),
            score: body.scores.as_ref().map(|s| s[index]).unwrap_or(0.0),
            position: index as i64 + 1,
            context: body.context_type.clone(),
            shown_at: now,
            clicked: false,
            played: false,
            liked: false,
        })
        .collect();

    let logged = impressions.len();
    ctx.dispatcher.impression_buffer().push_batch(impressions);

    Ok((
        StatusCode::CREATED,
        with_rate_headers(info, Json(ImpressionLogResponse { recommendation_id, logged })),
    ))
}

#[derive(Debug, Serialize)]
struct TelemetryAck {
    id: Uuid,
}

async fn log_search(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<SearchQueryInput>,
) -> ApiResult<(StatusCode, Response)> {
    let info = gate(&ctx, &principal, &plans::TELEMETRY_WRITE).await?;

    let id = ctx.ingestor.record_search(&principal, body).await?;
    Ok((StatusCode::CREATED, with_rate_headers(info, Json(TelemetryAck { id }))))
}

async fn log_view(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<ContentViewInput>,
) -> ApiResult<(StatusCode, Response)> {
    let info = gate(&ctx, &principal, &plans::TELEMETRY_WRITE).await?;

    let id = ctx.ingestor.record_view(&principal, body).await?;
    Ok((StatusCode::CREATED, with_rate_headers(info, Json(TelemetryAck { id }))))
}

async fn log_player_event(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<PlayerEventInput>,
) -> ApiResult<(StatusCode, Response)> {
    let info = gate(&ctx, &principal, &plans::TELEMETRY_WRITE).await?;

    let id = ctx.ingestor.record_player_event(&principal, body).await?;
    Ok((StatusCode::CREATED, with_rate_headers(info, Json(TelemetryAck { id }))))
}
