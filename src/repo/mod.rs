/// Typed persistence over the entity store
///
/// Runtime-bound sqlx queries with manual row mapping, so the crate builds
/// without DATABASE_URL. UUIDs and timestamps are stored as TEXT.

mod rows;

use crate::db::models::*;
use crate::error::{ApiError, ApiResult};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub use rows::{KeyUsageStats, SessionActivity};

#[derive(Clone)]
pub struct Repository {
    db: SqlitePool,
}

impl Repository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    // ========== Organizations ==========

    pub async fn create_organization(&self, org: &Organization) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO organizations (id, name, slug, plan, max_users, max_tracks, feature_overrides, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(org.id.to_string())
        .bind(&org.name)
        .bind(&org.slug)
        .bind(org.plan.as_str())
        .bind(org.max_users)
        .bind(org.max_tracks)
        .bind(serde_json::to_string(&org.feature_overrides).unwrap_or_else(|_| "{}".into()))
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&self.db)
        .await
        .map_err(map_unique_violation("organization slug already taken"))?;

        Ok(())
    }

    pub async fn get_organization(&self, org_id: Uuid) -> ApiResult<Organization> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = ?1")
            .bind(org_id.to_string())
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| ApiError::NotFound("Organization not found".to_string()))?;

        rows::organization(&row)
    }

    pub async fn update_organization_plan(&self, org_id: Uuid, plan: Plan, now: DateTime<Utc>) -> ApiResult<()> {
        let result = sqlx::query("UPDATE organizations SET plan = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(plan.as_str())
            .bind(now)
            .bind(org_id.to_string())
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("Organization not found".to_string()));
        }
        Ok(())
    }

    /// Cascade delete; FK constraints remove users, keys, sessions, telemetry.
    pub async fn delete_organization(&self, org_id: Uuid) -> ApiResult<()> {
        sqlx::query("DELETE FROM organizations WHERE id = ?1")
            .bind(org_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    // ========== Users ==========

    pub async fn create_user(&self, user: &User) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO users (id, org_id, email, username, password_hash, role, is_active, email_verified, last_login_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(user.id.to_string())
        .bind(user.org_id.to_string())
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.email_verified)
        .bind(user.last_login_at)
        .bind(user.created_at)
        .execute(&self.db)
        .await
        .map_err(map_unique_violation("email or username already registered"))?;

        Ok(())
    }

    pub async fn get_user(&self, user_id: Uuid) -> ApiResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?1")
            .bind(user_id.to_string())
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

        rows::user(&row)
    }

    /// Emails are case-folded on storage and compare.
    pub async fn get_user_by_email(&self, email: &str) -> ApiResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?1")
            .bind(email.to_lowercase())
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(rows::user).transpose()
    }

    pub async fn touch_last_login(&self, user_id: Uuid, now: DateTime<Utc>) -> ApiResult<()> {
        sqlx::query("UPDATE users SET last_login_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(user_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    // ========== Tracks ==========

    pub async fn create_track(&self, track: &Track) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO tracks (id, org_id, title, artist, genre, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(track.id.to_string())
        .bind(track.org_id.to_string())
        .bind(&track.title)
        .bind(&track.artist)
        .bind(&track.genre)
        .bind(track.duration_ms)
        .bind(track.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_track(&self, track_id: Uuid) -> ApiResult<Option<Track>> {
        let row = sqlx::query("SELECT * FROM tracks WHERE id = ?1")
            .bind(track_id.to_string())
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(rows::track).transpose()
    }

    /// `(created_at, id)` per track, for deterministic ranking tie-breaks.
    pub async fn track_tiebreak_meta(
        &self,
        track_ids: &[Uuid],
    ) -> ApiResult<std::collections::HashMap<Uuid, DateTime<Utc>>> {
        let mut meta = std::collections::HashMap::new();
        // Bounded fan-out (recommendation limits are <= 200); no dynamic IN clause
        for id in track_ids {
            let row = sqlx::query("SELECT created_at FROM tracks WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;
            if let Some(row) = row {
                meta.insert(*id, row.get("created_at"));
            }
        }
        Ok(meta)
    }

    // ========== API keys ==========

    pub async fn insert_api_key(&self, key: &ApiKey) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO api_keys (id, owner_user_id, org_id, name, key_hash, key_prefix, scopes, environment,
                                   limit_per_minute, limit_per_hour, limit_per_day, ip_allowlist, is_active,
                                   total_requests, last_used_at, expires_at, revoked_at, rotated_from, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        )
        .bind(key.id.to_string())
        .bind(key.owner_user_id.to_string())
        .bind(key.org_id.to_string())
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(serde_json::to_string(&key.scopes).unwrap_or_else(|_| "[]".into()))
        .bind(key.environment.as_str())
        .bind(key.limit_per_minute)
        .bind(key.limit_per_hour)
        .bind(key.limit_per_day)
        .bind(key.ip_allowlist.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default()))
        .bind(key.is_active)
        .bind(key.total_requests)
        .bind(key.last_used_at)
        .bind(key.expires_at)
        .bind(key.revoked_at)
        .bind(key.rotated_from.map(|id| id.to_string()))
        .bind(key.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Prefix collisions are possible; the verifier hashes against every row.
    pub async fn api_keys_by_prefix(&self, prefix: &str) -> ApiResult<Vec<ApiKey>> {
        let result = sqlx::query("SELECT * FROM api_keys WHERE key_prefix = ?1")
            .bind(prefix)
            .fetch_all(&self.db)
            .await?;

        result.iter().map(rows::api_key).collect()
    }

    pub async fn get_api_key(&self, key_id: Uuid, owner_user_id: Uuid) -> ApiResult<ApiKey> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?1 AND owner_user_id = ?2")
            .bind(key_id.to_string())
            .bind(owner_user_id.to_string())
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| ApiError::NotFound("API key not found".to_string()))?;

        rows::api_key(&row)
    }

    pub async fn list_api_keys(&self, owner_user_id: Uuid) -> ApiResult<Vec<ApiKey>> {
        let result = sqlx::query(
            "SELECT * FROM api_keys WHERE owner_user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(owner_user_id.to_string())
        .fetch_all(&self.db)
        .await?;

        result.iter().map(rows::api_key).collect()
    }

    pub async fn touch_api_key_usage(&self, key_id: Uuid, now: DateTime<Utc>) -> ApiResult<()> {
        sqlx::query(
            "UPDATE api_keys SET last_used_at = ?1, total_requests = total_requests + 1 WHERE id = ?2",
        )
        .bind(now)
        .bind(key_id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Schedules or immediately applies revocation.
    pub async fn set_api_key_revoked_at(
        &self,
        key_id: Uuid,
        owner_user_id: Uuid,
        revoked_at: DateTime<Utc>,
    ) -> ApiResult<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = ?1 WHERE id = ?2 AND owner_user_id = ?3 AND revoked_at IS NULL",
        )
        .bind(revoked_at)
        .bind(key_id.to_string())
        .bind(owner_user_id.to_string())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Either missing or already revoked; distinguish for the caller
            let exists = sqlx::query("SELECT id FROM api_keys WHERE id = ?1 AND owner_user_id = ?2")
                .bind(key_id.to_string())
                .bind(owner_user_id.to_string())
                .fetch_optional(&self.db)
                .await?
                .is_some();
            if !exists {
                return Err(ApiError::NotFound("API key not found".to_string()));
            }
        }
        Ok(())
    }

    pub async fn delete_api_key(&self, key_id: Uuid, owner_user_id: Uuid) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?1 AND owner_user_id = ?2")
            .bind(key_id.to_string())
            .bind(owner_user_id.to_string())
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("API key not found".to_string()));
        }
        Ok(())
    }

    pub async fn record_api_key_usage(&self, usage: &ApiKeyUsage) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO api_key_usage (id, key_id, endpoint, status_code, response_time_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(usage.id.to_string())
        .bind(usage.key_id.to_string())
        .bind(&usage.endpoint)
        .bind(usage.status_code)
        .bind(usage.response_time_ms)
        .bind(usage.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn api_key_usage_stats(
        &self,
        key_id: Uuid,
        since: DateTime<Utc>,
    ) -> ApiResult<rows::KeyUsageStats> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total,
                    SUM(CASE WHEN status_code < 400 THEN 1 ELSE 0 END) AS ok_count,
                    AVG(response_time_ms) AS avg_ms
             FROM api_key_usage WHERE key_id = ?1 AND created_at >= ?2",
        )
        .bind(key_id.to_string())
        .bind(since)
        .fetch_one(&self.db)
        .await?;

        let by_endpoint = sqlx::query(
            "SELECT endpoint, COUNT(*) AS count FROM api_key_usage
             WHERE key_id = ?1 AND created_at >= ?2 GROUP BY endpoint ORDER BY count DESC",
        )
        .bind(key_id.to_string())
        .bind(since)
        .fetch_all(&self.db)
        .await?;

        let total: i64 = totals.get("total");
        let ok_count: i64 = totals.get::<Option<i64>, _>("ok_count").unwrap_or(0);

        Ok(rows::KeyUsageStats {
            total_requests: total,
            successful_requests: ok_count,
            failed_requests: total - ok_count,
            avg_response_time_ms: totals.get::<Option<f64>, _>("avg_ms").unwrap_or(0.0),
            requests_by_endpoint: by_endpoint
                .iter()
                .map(|row| (row.get::<String, _>("endpoint"), row.get::<i64, _>("count")))
                .collect(),
        })
    }

    // ========== Listening sessions ==========

    pub async fn insert_session(&self, session: &ListeningSession) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO listening_sessions (id, user_id, device_id, device_type, platform, context_type, context_id,
                                             started_at, last_heartbeat_at, ended_at, ended_by, last_position_ms,
                                             last_track_id, total_duration_ms, tracks_played, tracks_skipped, completion_rate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(&session.device_id)
        .bind(session.device_type.as_str())
        .bind(&session.platform)
        .bind(&session.context_type)
        .bind(session.context_id.map(|id| id.to_string()))
        .bind(session.started_at)
        .bind(session.last_heartbeat_at)
        .bind(session.ended_at)
        .bind(session.ended_by.map(|e| e.as_str()))
        .bind(session.last_position_ms)
        .bind(session.last_track_id.map(|id| id.to_string()))
        .bind(session.total_duration_ms)
        .bind(session.tracks_played)
        .bind(session.tracks_skipped)
        .bind(session.completion_rate)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: Uuid) -> ApiResult<Option<ListeningSession>> {
        let row = sqlx::query("SELECT * FROM listening_sessions WHERE id = ?1")
            .bind(session_id.to_string())
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(rows::session).transpose()
    }

    pub async fn active_session_for_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> ApiResult<Option<ListeningSession>> {
        let row = sqlx::query(
            "SELECT * FROM listening_sessions
             WHERE user_id = ?1 AND device_id = ?2 AND ended_at IS NULL
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(user_id.to_string())
        .bind(device_id)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(rows::session).transpose()
    }

    pub async fn update_heartbeat(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        position_ms: Option<i64>,
        current_track_id: Option<Uuid>,
    ) -> ApiResult<()> {
        sqlx::query(
            "UPDATE listening_sessions
             SET last_heartbeat_at = ?1,
                 last_position_ms = COALESCE(?2, last_position_ms),
                 last_track_id = COALESCE(?3, last_track_id)
             WHERE id = ?4 AND ended_at IS NULL",
        )
        .bind(now)
        .bind(position_ms)
        .bind(current_track_id.map(|id| id.to_string()))
        .bind(session_id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Conditional transition out of the active state. Returns false when the
    /// session was already ended, which makes summary finalization
    /// exactly-once even under concurrent End and sweep.
    pub async fn finalize_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        ended_by: SessionEndedBy,
        activity: &SessionActivity,
    ) -> ApiResult<bool> {
        let result = sqlx::query(
            "UPDATE listening_sessions
             SET ended_at = ?1, ended_by = ?2, total_duration_ms = ?3,
                 tracks_played = ?4, tracks_skipped = ?5, completion_rate = ?6
             WHERE id = ?7 AND ended_at IS NULL",
        )
        .bind(ended_at)
        .bind(ended_by.as_str())
        .bind(activity.total_duration_ms)
        .bind(activity.tracks_played)
        .bind(activity.tracks_skipped)
        .bind(activity.completion_rate)
        .bind(session_id.to_string())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Aggregate the session's interactions into summary inputs.
    pub async fn session_activity(&self, session_id: Uuid) -> ApiResult<SessionActivity> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(CASE WHEN interaction_type IN ('play', 'complete') THEN COALESCE(play_duration_ms, 0) ELSE 0 END), 0) AS total_ms,
                    SUM(CASE WHEN interaction_type IN ('play', 'complete') THEN 1 ELSE 0 END) AS played,
                    SUM(CASE WHEN interaction_type = 'skip' THEN 1 ELSE 0 END) AS skipped,
                    SUM(CASE WHEN interaction_type = 'complete' THEN 1 ELSE 0 END) AS completed
             FROM interactions WHERE session_id = ?1",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.db)
        .await?;

        let played: i64 = row.get::<Option<i64>, _>("played").unwrap_or(0);
        let skipped: i64 = row.get::<Option<i64>, _>("skipped").unwrap_or(0);
        let completed: i64 = row.get::<Option<i64>, _>("completed").unwrap_or(0);
        let started = played + skipped;

        Ok(SessionActivity {
            total_duration_ms: row.get::<Option<i64>, _>("total_ms").unwrap_or(0),
            tracks_played: played,
            tracks_skipped: skipped,
            completion_rate: if started > 0 { completed as f64 / started as f64 } else { 0.0 },
        })
    }

    pub async fn list_sessions(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> ApiResult<Vec<ListeningSession>> {
        let result = sqlx::query(
            "SELECT * FROM listening_sessions
             WHERE user_id = ?1 AND started_at >= ?2
             ORDER BY started_at DESC LIMIT ?3 OFFSET ?4",
        )
        .bind(user_id.to_string())
        .bind(since)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        result.iter().map(rows::session).collect()
    }

    // ========== Interactions ==========

    pub async fn insert_interaction(&self, event: &Interaction) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO interactions (id, user_id, track_id, session_id, interaction_type, play_duration_ms,
                                       position_ms, source, source_id, recommendation_id, device_type,
                                       skip_reason, mood, activity, completion_override, client_seq, extensions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        )
        .bind(event.id.to_string())
        .bind(event.user_id.to_string())
        .bind(event.track_id.to_string())
        .bind(event.session_id.map(|id| id.to_string()))
        .bind(event.interaction_type.as_str())
        .bind(event.play_duration_ms)
        .bind(event.position_ms)
        .bind(event.source.as_str())
        .bind(event.source_id.map(|id| id.to_string()))
        .bind(event.recommendation_id.map(|id| id.to_string()))
        .bind(event.device_type.map(|d| d.as_str()))
        .bind(&event.skip_reason)
        .bind(&event.mood)
        .bind(&event.activity)
        .bind(event.completion_override)
        .bind(event.client_seq)
        .bind(event.extensions.to_string())
        .bind(event.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn find_feedback_interaction(
        &self,
        user_id: Uuid,
        recommendation_id: Uuid,
        interaction_type: InteractionType,
    ) -> ApiResult<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT id FROM interactions
             WHERE user_id = ?1 AND recommendation_id = ?2 AND interaction_type = ?3
             LIMIT 1",
        )
        .bind(user_id.to_string())
        .bind(recommendation_id.to_string())
        .bind(interaction_type.as_str())
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| rows::parse_uuid(&r.get::<String, _>("id"))).transpose()
    }

    // ========== Impressions ==========

    pub async fn insert_impression(&self, impression: &Impression) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO impressions (id, user_id, track_id, recommendation_id, model_type, model_version,
                                      score, position, context, shown_at, clicked, played, liked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(impression.id.to_string())
        .bind(impression.user_id.to_string())
        .bind(impression.track_id.to_string())
        .bind(impression.recommendation_id.to_string())
        .bind(&impression.model_type)
        .bind(&impression.model_version)
        .bind(impression.score)
        .bind(impression.position)
        .bind(&impression.context)
        .bind(impression.shown_at)
        .bind(impression.clicked)
        .bind(impression.played)
        .bind(impression.liked)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn impressions_for_recommendation(
        &self,
        recommendation_id: Uuid,
        user_id: Uuid,
    ) -> ApiResult<Vec<Impression>> {
        let result = sqlx::query(
            "SELECT * FROM impressions WHERE recommendation_id = ?1 AND user_id = ?2 ORDER BY position",
        )
        .bind(recommendation_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.db)
        .await?;

        result.iter().map(rows::impression).collect()
    }

    /// Set-true-once flag update; already-true columns are left untouched.
    pub async fn mark_impression_flags(
        &self,
        recommendation_id: Uuid,
        user_id: Uuid,
        track_id: Option<Uuid>,
        clicked: bool,
        played: bool,
        liked: bool,
    ) -> ApiResult<u64> {
        let result = sqlx::query(
            "UPDATE impressions
             SET clicked = clicked OR ?1, played = played OR ?2, liked = liked OR ?3
             WHERE recommendation_id = ?4 AND user_id = ?5
               AND (?6 IS NULL OR track_id = ?6)",
        )
        .bind(clicked)
        .bind(played)
        .bind(liked)
        .bind(recommendation_id.to_string())
        .bind(user_id.to_string())
        .bind(track_id.map(|id| id.to_string()))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    // ========== Telemetry ==========

    pub async fn insert_search_query(&self, record: &SearchQuery) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO search_queries (id, user_id, query, search_type, results_count, clicked_result_id,
                                         clicked_position, session_id, device_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(record.id.to_string())
        .bind(record.user_id.to_string())
        .bind(&record.query)
        .bind(&record.search_type)
        .bind(record.results_count)
        .bind(record.clicked_result_id.map(|id| id.to_string()))
        .bind(record.clicked_position)
        .bind(record.session_id.map(|id| id.to_string()))
        .bind(record.device_type.map(|d| d.as_str()))
        .bind(record.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn insert_content_view(&self, record: &ContentView) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO content_views (id, user_id, content_type, content_id, source, source_id,
                                        session_id, time_spent_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(record.id.to_string())
        .bind(record.user_id.to_string())
        .bind(&record.content_type)
        .bind(record.content_id.to_string())
        .bind(&record.source)
        .bind(record.source_id.map(|id| id.to_string()))
        .bind(record.session_id.map(|id| id.to_string()))
        .bind(record.time_spent_ms)
        .bind(record.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn insert_player_event(&self, record: &PlayerEvent) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO player_events (id, user_id, track_id, session_id, event_type, position_ms,
                                        seek_from_ms, seek_to_ms, buffer_duration_ms, error_code, extensions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(record.id.to_string())
        .bind(record.user_id.to_string())
        .bind(record.track_id.to_string())
        .bind(record.session_id.map(|id| id.to_string()))
        .bind(&record.event_type)
        .bind(record.position_ms)
        .bind(record.seek_from_ms)
        .bind(record.seek_to_ms)
        .bind(record.buffer_duration_ms)
        .bind(&record.error_code)
        .bind(record.extensions.to_string())
        .bind(record.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

fn map_unique_violation(message: &'static str) -> impl Fn(sqlx::Error) -> ApiError {
    move |e: sqlx::Error| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.message().contains("UNIQUE constraint failed") {
                return ApiError::Conflict(message.to_string());
            }
        }
        ApiError::Database(e)
    }
}
