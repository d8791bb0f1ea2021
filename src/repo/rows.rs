/// Row-to-entity mapping helpers
use crate::db::models::*;
use crate::error::{ApiError, ApiResult};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

/// Inputs to a session summary, aggregated from its interactions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionActivity {
    pub total_duration_ms: i64,
    pub tracks_played: i64,
    pub tracks_skipped: i64,
    pub completion_rate: f64,
}

/// API-key usage aggregates over a reporting period.
#[derive(Debug, Clone)]
pub struct KeyUsageStats {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub avg_response_time_ms: f64,
    pub requests_by_endpoint: Vec<(String, i64)>,
}

pub fn parse_uuid(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| ApiError::Internal(format!("corrupt id in database: {}", e)))
}

fn get_uuid(row: &SqliteRow, column: &str) -> ApiResult<Uuid> {
    parse_uuid(&row.get::<String, _>(column))
}

fn get_opt_uuid(row: &SqliteRow, column: &str) -> ApiResult<Option<Uuid>> {
    row.get::<Option<String>, _>(column)
        .as_deref()
        .map(parse_uuid)
        .transpose()
}

pub fn organization(row: &SqliteRow) -> ApiResult<Organization> {
    Ok(Organization {
        id: get_uuid(row, "id")?,
        name: row.get("name"),
        slug: row.get("slug"),
        plan: Plan::parse_or_floor(&row.get::<String, _>("plan")),
        max_users: row.get("max_users"),
        max_tracks: row.get("max_tracks"),
        feature_overrides: serde_json::from_str(&row.get::<String, _>("feature_overrides"))
            .unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub fn user(row: &SqliteRow) -> ApiResult<User> {
    Ok(User {
        id: get_uuid(row, "id")?,
        org_id: get_uuid(row, "org_id")?,
        email: row.get("email"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        role: Role::parse(&row.get::<String, _>("role")),
        is_active: row.get("is_active"),
        email_verified: row.get("email_verified"),
        last_login_at: row.get("last_login_at"),
        created_at: row.get("created_at"),
    })
}

pub fn track(row: &SqliteRow) -> ApiResult<Track> {
    Ok(Track {
        id: get_uuid(row, "id")?,
        org_id: get_uuid(row, "org_id")?,
        title: row.get("title"),
        artist: row.get("artist"),
        genre: row.get("genre"),
        duration_ms: row.get("duration_ms"),
        created_at: row.get("created_at"),
    })
}

pub fn api_key(row: &SqliteRow) -> ApiResult<ApiKey> {
    let environment = row.get::<String, _>("environment");
    Ok(ApiKey {
        id: get_uuid(row, "id")?,
        owner_user_id: get_uuid(row, "owner_user_id")?,
        org_id: get_uuid(row, "org_id")?,
        name: row.get("name"),
        key_hash: row.get("key_hash"),
        key_prefix: row.get("key_prefix"),
        scopes: serde_json::from_str(&row.get::<String, _>("scopes")).unwrap_or_default(),
        environment: Environment::parse(&environment).unwrap_or(Environment::Production),
        limit_per_minute: row.get("limit_per_minute"),
        limit_per_hour: row.get("limit_per_hour"),
        limit_per_day: row.get("limit_per_day"),
        ip_allowlist: row
            .get::<Option<String>, _>("ip_allowlist")
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        is_active: row.get("is_active"),
        total_requests: row.get("total_requests"),
        last_used_at: row.get("last_used_at"),
        expires_at: row.get("expires_at"),
        revoked_at: row.get("revoked_at"),
        rotated_from: get_opt_uuid(row, "rotated_from")?,
        created_at: row.get("created_at"),
    })
}

pub fn session(row: &SqliteRow) -> ApiResult<ListeningSession> {
    let device_type = row.get::<String, _>("device_type");
    Ok(ListeningSession {
        id: get_uuid(row, "id")?,
        user_id: get_uuid(row, "user_id")?,
        device_id: row.get("device_id"),
        device_type: DeviceType::parse(&device_type).unwrap_or(DeviceType::Web),
        platform: row.get("platform"),
        context_type: row.get("context_type"),
        context_id: get_opt_uuid(row, "context_id")?,
        started_at: row.get("started_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        ended_at: row.get("ended_at"),
        ended_by: row
            .get::<Option<String>, _>("ended_by")
            .as_deref()
            .and_then(SessionEndedBy::parse),
        last_position_ms: row.get("last_position_ms"),
        last_track_id: get_opt_uuid(row, "last_track_id")?,
        total_duration_ms: row.get("total_duration_ms"),
        tracks_played: row.get("tracks_played"),
        tracks_skipped: row.get("tracks_skipped"),
        completion_rate: row.get("completion_rate"),
    })
}

pub fn impression(row: &SqliteRow) -> ApiResult<Impression> {
    Ok(Impression {
        id: get_uuid(row, "id")?,
        user_id: get_uuid(row, "user_id")?,
        track_id: get_uuid(row, "track_id")?,
        recommendation_id: get_uuid(row, "recommendation_id")?,
        model_type: row.get("model_type"),
        model_version: row.get("model_version"),
        score: row.get("score"),
        position: row.get("position"),
        context: row.get("context"),
        shown_at: row.get("shown_at"),
        clicked: row.get("clicked"),
        played: row.get("played"),
        liked: row.get("liked"),
    })
}
