/// Listening-session endpoints
use super::middleware::{gate, with_rate_headers};
use crate::auth::Principal;
use crate::context::AppContext;
use crate::db::models::{DeviceType, ListeningSession, SessionEndedBy};
use crate::error::{ApiError, ApiResult};
use crate::gate::plans;
use crate::sessions::{HeartbeatOutcome, StartSession};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/sessions/start", post(start))
        .route("/sessions/:id/heartbeat", put(heartbeat))
        .route("/sessions/:id/end", post(end))
        .route("/sessions", get(list))
        .route("/sessions/:id", get(get_one))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    device_id: String,
    device_type: DeviceType,
    platform: Option<String>,
    context_type: Option<String>,
    context_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    id: Uuid,
    device_id: String,
    device_type: DeviceType,
    platform: Option<String>,
    started_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    ended_by: Option<SessionEndedBy>,
    total_duration_ms: i64,
    tracks_played: i64,
    tracks_skipped: i64,
    completion_rate: f64,
}

impl From<ListeningSession> for SessionResponse {
    fn from(session: ListeningSession) -> Self {
        Self {
            id: session.id,
            device_id: session.device_id,
            device_type: session.device_type,
            platform: session.platform,
            started_at: session.started_at,
            last_heartbeat_at: session.last_heartbeat_at,
            ended_at: session.ended_at,
            ended_by: session.ended_by,
            total_duration_ms: session.total_duration_ms,
            tracks_played: session.tracks_played,
            tracks_skipped: session.tracks_skipped,
            completion_rate: session.completion_rate,
        }
    }
}

async fn start(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<StartRequest>,
) -> ApiResult<(StatusCode, Response)> {
    let info = gate(&ctx, &principal, &plans::SESSIONS_WRITE).await?;

    let session = ctx
        .sessions
        .start(
            principal.user_id,
            StartSession {
                device_id: body.device_id,
                device_type: body.device_type,
                platform: body.platform,
                context_type: body.context_type,
                context_id: body.context_id,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        with_rate_headers(info, Json(SessionResponse::from(session))),
    ))
}

#[derive(Debug, Deserialize, Default)]
struct HeartbeatRequest {
    position_ms: Option<i64>,
    current_track_id: Option<Uuid>,
}

async fn heartbeat(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(session_id): Path<Uuid>,
    body: Option<Json<HeartbeatRequest>>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::SESSIONS_WRITE).await?;

    let Json(body) = body.unwrap_or_default();
    let outcome = ctx
        .sessions
        .heartbeat(principal.user_id, session_id, body.position_ms, body.current_track_id)
        .await?;

    match outcome {
        HeartbeatOutcome::Alive => Ok(with_rate_headers(info, StatusCode::NO_CONTENT)),
        HeartbeatOutcome::Ended => {
            Err(ApiError::Conflict("Session has already ended".to_string()))
        }
    }
}

async fn end(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::SESSIONS_WRITE).await?;

    let session = ctx.sessions.end(principal.user_id, session_id).await?;
    Ok(with_rate_headers(info, Json(SessionResponse::from(session))))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_days")]
    days: i64,
    #[serde(default = "default_list_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_days() -> i64 {
    30
}
fn default_list_limit() -> i64 {
    50
}

async fn list(
    State(ctx): State<AppContext>,
    principal: Principal,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::SESSIONS_READ).await?;

    let sessions = ctx
        .sessions
        .list(principal.user_id, query.days, query.limit, query.offset)
        .await?;

    Ok(with_rate_headers(
        info,
        Json(sessions.into_iter().map(SessionResponse::from).collect::<Vec<_>>()),
    ))
}

async fn get_one(
    State(ctx): State<AppContext>,
    principal: Principal,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::SESSIONS_READ).await?;

    let session = ctx.sessions.get(principal.user_id, session_id).await?;
    Ok(with_rate_headers(info, Json(SessionResponse::from(session))))
}
