/// Interaction ingestion endpoints
use super::middleware::{gate, with_rate_headers};
use crate::auth::Principal;
use crate::context::AppContext;
use crate::error::ApiResult;
use crate::gate::plans;
use crate::ingest::IngestEvent;
use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
    routing::post,
    Json, Router,
};
use serde::Deserialize;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/interactions", post(ingest_one))
        .route("/interactions/batch", post(ingest_batch))
}

async fn ingest_one(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(event): Json<IngestEvent>,
) -> ApiResult<(StatusCode, Response)> {
    let info = gate(&ctx, &principal, &plans::INTERACTIONS_WRITE).await?;

    let outcome = ctx.ingestor.ingest(&principal, event).await?;
    Ok((StatusCode::CREATED, with_rate_headers(info, Json(outcome))))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    events: Vec<IngestEvent>,
}

async fn ingest_batch(
    State(ctx): State<AppContext>,
    principal: Principal,
    Json(body): Json<BatchRequest>,
) -> ApiResult<Response> {
    let info = gate(&ctx, &principal, &plans::INTERACTIONS_WRITE).await?;

    let result = ctx.ingestor.ingest_batch(&principal, body.events).await?;
    Ok(with_rate_headers(info, Json(result)))
}
