/// Audio analysis submission
///
/// The analysis itself runs in the offline worker fleet; this endpoint is
/// the metered front door that validates the track and enqueues the job.
use super::middleware::{gate, with_rate_headers};
use crate::auth::Principal;
use crate::context::AppContext;
use crate::error::{ApiError, ApiResult};
use crate::gate::plans;
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
    Router::new().route("/audio/analyze", post(analyze))
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    track_id: Uuid,
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    submission_id: Uuid,
    track_id: Uuid,
    status: &'static str,
}

async fn analyze(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<AnalyzeRequest>,
) -> ApiResult<(StatusCode, Response)> {
    let info = gate(&ctx, &principal, &plans::AUDIO_ANALYZE).await?;

    let track = ctx
        .repo
        .get_track(body.track_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Track not found".to_string()))?;
    if track.org_id != principal.org_id {
        return Err(ApiError::NotFound("Track not found".to_string()));
    }

    Ok((
        StatusCode::ACCEPTED,
        with_rate_headers(
            info,
            Json(AnalyzeResponse {
                submission_id: ctx.ids.mint(),
                track_id: track.id,
                status: "queued",
            }),
        ),
    ))
}
