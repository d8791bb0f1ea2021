/// Request middleware: authentication, metrics, API-key usage accounting
use crate::auth::{extract_bearer_token, Principal};
use crate::context::AppContext;
use crate::db::models::ApiKeyUsage;
use crate::error::ApiResult;
use crate::gate::{plans::ResourceDescriptor, RateLimitInfo};
use crate::metrics;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Instant;

/// Authenticate the request when a bearer token is present and stash the
/// Principal in request extensions; handlers that require auth extract it.
/// Also records HTTP metrics and, for API-key callers, the usage log row.
pub async fn authenticate(
    State(ctx): State<AppContext>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let mut key_id = None;
    if let Some(token) = extract_bearer_token(req.headers()) {
        let client_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());

        // Invalid tokens are not fatal here; protected handlers surface the
        // precise failure through the extractor.
        if let Ok(principal) = ctx.verifier.verify(&token, client_ip).await {
            key_id = principal.key_id;
            req.extensions_mut().insert(principal);
        }
    }

    let response = next.run(req).await;

    let status = response.status().as_u16();
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status.to_string()])
        .inc();
    metrics::HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(started.elapsed().as_secs_f64());

    // Usage accounting is fire-and-forget
    if let Some(key_id) = key_id {
        let repo = ctx.repo.clone();
        let now = ctx.clock.now();
        let id = ctx.ids.mint();
        let elapsed_ms = started.elapsed().as_millis() as i64;
        tokio::spawn(async move {
            let usage = ApiKeyUsage {
                id,
                key_id,
                endpoint: path,
                status_code: status as i64,
                response_time_ms: elapsed_ms,
                created_at: now,
            };
            if let Err(e) = repo.record_api_key_usage(&usage).await {
                tracing::debug!(key_id = %key_id, "usage log write failed: {}", e);
            }
        });
    }

    response
}

/// Scope check plus the three-layer gate, in one call per handler.
pub async fn gate(
    ctx: &AppContext,
    principal: &Principal,
    descriptor: &ResourceDescriptor,
) -> ApiResult<Option<RateLimitInfo>> {
    if let Some(scope) = descriptor.scope {
        principal.require_scope(scope)?;
    }
    ctx.gate.check(principal, descriptor).await
}

/// Attach the advisory rate-limit headers for the most-constrained window.
pub fn with_rate_headers(info: Option<RateLimitInfo>, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    if let Some(info) = info {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&info.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }
        if let Ok(value) = HeaderValue::from_str(&info.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }
        if let Ok(value) = HeaderValue::from_str(&info.reset_unix.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn rate_headers_are_attached() {
        let info = RateLimitInfo { limit: 100, remaining: 42, reset_unix: 1_750_000_000 };
        let response = with_rate_headers(Some(info), (StatusCode::OK, "ok"));

        let headers = response.headers();
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "100");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "42");
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "1750000000");
    }

    #[test]
    fn absent_info_leaves_headers_off() {
        let response = with_rate_headers(None, (StatusCode::OK, "ok"));
        assert!(response.headers().get("X-RateLimit-Limit").is_none());
    }
}
