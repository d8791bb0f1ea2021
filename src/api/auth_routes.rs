/// Registration, login, and principal introspection
use crate::auth::{hashing, Principal};
use crate::context::AppContext;
use crate::db::models::{Organization, Plan, Role, User};
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    username: Option<String>,
    org_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_at: DateTime<Utc>,
    user_id: Uuid,
    org_id: Uuid,
}

#[derive(Debug, Serialize)]
struct MeResponse {
    user_id: Uuid,
    org_id: Uuid,
    plan: String,
    scopes: Vec<String>,
    auth_method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_id: Option<Uuid>,
}

fn validate_email(email: &str) -> ApiResult<String> {
    let email = email.trim().to_lowercase();
    let valid = email.len() <= 254
        && email.split_once('@').map(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }) == Some(true);
    if !valid {
        return Err(ApiError::Validation("Invalid email address".to_string()));
    }
    Ok(email)
}

fn slugify(input: &str) -> String {
    let slug: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

/// Signup creates an organization on the free plan with the caller as owner.
async fn register(
    State(ctx): State<AppContext>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<TokenResponse>)> {
    ctx.public_limiter.check()?;

    let email = validate_email(&body.email)?;
    if body.password.len() < 8 {
        return Err(ApiError::Validation(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let now = ctx.clock.now();
    let org_name = body
        .org_name
        .clone()
        .unwrap_or_else(|| email.split('@').next().unwrap_or("listener").to_string());

    let org = Organization {
        id: ctx.ids.mint(),
        name: org_name.clone(),
        // A random suffix keeps slugs unique without a retry loop
        slug: format!("{}-{}", slugify(&org_name), &ctx.ids.mint().simple().to_string()[..8]),
        plan: Plan::Free,
        max_users: 1,
        max_tracks: 1_000,
        feature_overrides: HashMap::new(),
        created_at: now,
        updated_at: now,
    };
    ctx.repo.create_organization(&org).await?;

    let user = User {
        id: ctx.ids.mint(),
        org_id: org.id,
        email,
        username: body.username,
        password_hash: hashing::hash_secret(&body.password)?,
        role: Role::Owner,
        is_active: true,
        email_verified: false,
        last_login_at: Some(now),
        created_at: now,
    };
    ctx.repo.create_user(&user).await?;

    let (access_token, expires_at) = ctx.verifier.signer().issue(user.id, now)?;

    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_at,
            user_id: user.id,
            org_id: org.id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    State(ctx): State<AppContext>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    ctx.public_limiter.check()?;

    let email = body.email.trim().to_lowercase();
    let user = ctx
        .repo
        .get_user_by_email(&email)
        .await?
        .ok_or(ApiError::UnknownCredential)?;

    if !hashing::verify_secret(&body.password, &user.password_hash) {
        return Err(ApiError::UnknownCredential);
    }
    if !user.is_active {
        return Err(ApiError::RevokedCredential);
    }

    let now = ctx.clock.now();
    ctx.repo.touch_last_login(user.id, now).await?;
    let (access_token, expires_at) = ctx.verifier.signer().issue(user.id, now)?;

    Ok(Json(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_at,
        user_id: user.id,
        org_id: user.org_id,
    }))
}

async fn me(principal: Principal) -> Json<MeResponse> {
    Json(MeResponse {
        user_id: principal.user_id,
        org_id: principal.org_id,
        plan: principal.plan.as_str().to_string(),
        scopes: principal.scopes.clone(),
        auth_method: principal.auth_method.as_str(),
        key_id: principal.key_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert_eq!(validate_email("Fan@Example.COM").unwrap(), "fan@example.com");
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@nodot").is_err());
    }

    #[test]
    fn slugify_strips_punctuation() {
        assert_eq!(slugify("Acme Records!"), "acme-records");
        assert_eq!(slugify("--weird--"), "weird");
    }
}
