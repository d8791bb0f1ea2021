/// Listening-session lifecycle
///
/// State machine: Active --heartbeat--> Active; Active --end--> Ended;
/// Active --idle past IDLE_TIMEOUT--> Expired (applied by the sweep, or
/// lazily by the next heartbeat/end that observes the stale session).
use crate::cache::{keys as cache_keys, Cache};
use crate::clock::{SharedClock, SharedIdGen};
use crate::db::models::{DeviceType, ListeningSession, SessionEndedBy};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::repo::Repository;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Client-supplied fields for starting a session
#[derive(Debug, Clone)]
pub struct StartSession {
    pub device_id: String,
    pub device_type: DeviceType,
    pub platform: Option<String>,
    pub context_type: Option<String>,
    pub context_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Alive,
    Ended,
}

#[derive(Clone)]
pub struct SessionManager {
    repo: Repository,
    cache: Arc<dyn Cache>,
    clock: SharedClock,
    ids: SharedIdGen,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        repo: Repository,
        cache: Arc<dyn Cache>,
        clock: SharedClock,
        ids: SharedIdGen,
        idle_timeout_secs: i64,
    ) -> Self {
        Self {
            repo,
            cache,
            clock,
            ids,
            idle_timeout: Duration::seconds(idle_timeout_secs),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Start a session. At most one active session per (user, device); a
    /// prior active one is expired first and its summary finalized.
    pub async fn start(&self, user_id: Uuid, params: StartSession) -> ApiResult<ListeningSession> {
        if params.device_id.trim().is_empty() {
            return Err(ApiError::Validation("device_id cannot be empty".to_string()));
        }

        let now = self.clock.now();

        if let Some(prior) = self
            .repo
            .active_session_for_device(user_id, &params.device_id)
            .await?
        {
            self.expire(&prior, now).await?;
        }

        let session = ListeningSession {
            id: self.ids.mint(),
            user_id,
            device_id: params.device_id,
            device_type: params.device_type,
            platform: params.platform,
            context_type: params.context_type,
            context_id: params.context_id,
            started_at: now,
            last_heartbeat_at: now,
            ended_at: None,
            ended_by: None,
            last_position_ms: None,
            last_track_id: None,
            total_duration_ms: 0,
            tracks_played: 0,
            tracks_skipped: 0,
            completion_rate: 0.0,
        };

        self.repo.insert_session(&session).await?;
        self.cache
            .set(&cache_keys::session_active(session.id), &user_id.to_string(), None)
            .await?;

        Ok(session)
    }

    /// Refresh liveness; opportunistically persists last-known position.
    pub async fn heartbeat(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        position_ms: Option<i64>,
        current_track_id: Option<Uuid>,
    ) -> ApiResult<HeartbeatOutcome> {
        let session = self.owned_session(user_id, session_id).await?;
        let now = self.clock.now();

        if session.ended_at.is_some() {
            return Ok(HeartbeatOutcome::Ended);
        }

        // A heartbeat arriving after the idle window closes the session
        // rather than resurrecting it.
        if !session.is_active_at(now, self.idle_timeout) {
            self.expire(&session, now).await?;
            return Ok(HeartbeatOutcome::Ended);
        }

        self.repo
            .update_heartbeat(session_id, now, position_ms, current_track_id)
            .await?;

        Ok(HeartbeatOutcome::Alive)
    }

    /// End a session and finalize its summary. Idempotent: ending an
    /// already-ended session returns it unchanged. A session past the idle
    /// window ends as a timeout regardless of who asked.
    pub async fn end(&self, user_id: Uuid, session_id: Uuid) -> ApiResult<ListeningSession> {
        let session = self.owned_session(user_id, session_id).await?;
        let now = self.clock.now();

        if session.ended_at.is_some() {
            return Ok(session);
        }

        let ended_by = if session.is_active_at(now, self.idle_timeout) {
            SessionEndedBy::Client
        } else {
            SessionEndedBy::Timeout
        };

        self.finalize(&session, now, ended_by).await?;

        self.owned_session(user_id, session_id).await
    }

    pub async fn get(&self, user_id: Uuid, session_id: Uuid) -> ApiResult<ListeningSession> {
        self.owned_session(user_id, session_id).await
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        days: i64,
        limit: i64,
        offset: i64,
    ) -> ApiResult<Vec<ListeningSession>> {
        let since = self.clock.now() - Duration::days(days.clamp(1, 365));
        self.repo
            .list_sessions(user_id, since, limit.clamp(1, 200), offset.max(0))
            .await
    }

    /// Transition a stale session to Expired. Safe to race: the conditional
    /// update finalizes exactly once.
    pub async fn expire(&self, session: &ListeningSession, now: DateTime<Utc>) -> ApiResult<()> {
        self.finalize(session, now, SessionEndedBy::Timeout).await
    }

    async fn finalize(
        &self,
        session: &ListeningSession,
        now: DateTime<Utc>,
        ended_by: SessionEndedBy,
    ) -> ApiResult<()> {
        let activity = self.repo.session_activity(session.id).await?;
        let finalized = self
            .repo
            .finalize_session(session.id, now, ended_by, &activity)
            .await?;

        if finalized {
            tracing::info!(
                session_id = %session.id,
                user_id = %session.user_id,
                ended_by = ended_by.as_str(),
                tracks_played = activity.tracks_played,
                tracks_skipped = activity.tracks_skipped,
                total_duration_ms = activity.total_duration_ms,
                "session summary finalized"
            );
        }

        self.cache.delete(&cache_keys::session_active(session.id)).await?;
        self.cache.delete(&cache_keys::session_seq(session.id)).await?;

        Ok(())
    }

    /// Expiry sweep over `session:active:*` tags. Returns how many sessions
    /// were transitioned.
    pub async fn sweep_expired(&self) -> ApiResult<u64> {
        let now = self.clock.now();
        let tags = self
            .cache
            .keys_by_prefix(cache_keys::SESSION_ACTIVE_PREFIX)
            .await?;

        let mut expired = 0u64;
        for tag in tags {
            let Some(raw_id) = tag.strip_prefix(cache_keys::SESSION_ACTIVE_PREFIX) else {
                continue;
            };
            let Ok(session_id) = Uuid::parse_str(raw_id) else {
                let _ = self.cache.delete(&tag).await;
                continue;
            };

            match self.repo.get_session(session_id).await? {
                Some(session) if session.ended_at.is_some() => {
                    // Ended elsewhere; drop the stale tag
                    let _ = self.cache.delete(&tag).await;
                }
                Some(session) if !session.is_active_at(now, self.idle_timeout) => {
                    self.expire(&session, now).await?;
                    metrics::SESSIONS_EXPIRED_TOTAL.inc();
                    expired += 1;
                }
                Some(_) => {}
                None => {
                    let _ = self.cache.delete(&tag).await;
                }
            }
        }

        Ok(expired)
    }

    async fn owned_session(&self, user_id: Uuid, session_id: Uuid) -> ApiResult<ListeningSession> {
        let session = self
            .repo
            .get_session(session_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;

        if session.user_id != user_id {
            // Do not reveal other users' session ids
            return Err(ApiError::NotFound("Session not found".to_string()));
        }

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::{ManualClock, SeqIdGen};
    use crate::db::models::{Organization, Plan, Role, User};
    use chrono::TimeZone;
    use std::collections::HashMap;

    async fn setup() -> (SessionManager, Repository, Arc<ManualClock>, Uuid) {
        let pool = crate::db::create_memory_pool().await.unwrap();
        let repo = Repository::new(pool);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap(),
        ));
        let cache = Arc::new(MemoryCache::new());
        let ids = Arc::new(SeqIdGen::default());

        let now = clock.now();
        let org = Organization {
            id: Uuid::from_u128(100),
            name: "Acme".into(),
            slug: "acme".into(),
            plan: Plan::Starter,
            max_users: 10,
            max_tracks: 1000,
            feature_overrides: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        repo.create_organization(&org).await.unwrap();

        let user = User {
            id: Uuid::from_u128(101),
            org_id: org.id,
            email: "listener@acme.test".into(),
            username: None,
            password_hash: "x".into(),
            role: Role::User,
            is_active: true,
            email_verified: true,
            last_login_at: None,
            created_at: now,
        };
        repo.create_user(&user).await.unwrap();

        let manager = SessionManager::new(repo.clone(), cache, clock.clone(), ids, 900);
        (manager, repo, clock, user.id)
    }

    fn start_params(device: &str) -> StartSession {
        StartSession {
            device_id: device.into(),
            device_type: DeviceType::Mobile,
            platform: Some("iOS".into()),
            context_type: None,
            context_id: None,
        }
    }

    #[tokio::test]
    async fn start_heartbeat_end_happy_path() {
        let (manager, _, clock, user_id) = setup().await;

        let session = manager.start(user_id, start_params("phone-1")).await.unwrap();
        clock.advance(Duration::minutes(5));

        let outcome = manager
            .heartbeat(user_id, session.id, Some(30_000), None)
            .await
            .unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Alive);

        let ended = manager.end(user_id, session.id).await.unwrap();
        assert!(ended.ended_at.is_some());
        assert_eq!(ended.ended_by, Some(SessionEndedBy::Client));
    }

    #[tokio::test]
    async fn second_start_on_same_device_expires_prior() {
        let (manager, _, _, user_id) = setup().await;

        let first = manager.start(user_id, start_params("phone-1")).await.unwrap();
        let second = manager.start(user_id, start_params("phone-1")).await.unwrap();
        assert_ne!(first.id, second.id);

        let prior = manager.get(user_id, first.id).await.unwrap();
        assert_eq!(prior.ended_by, Some(SessionEndedBy::Timeout));
        assert!(manager.get(user_id, second.id).await.unwrap().ended_at.is_none());
    }

    #[tokio::test]
    async fn end_after_idle_window_reports_timeout() {
        let (manager, _, clock, user_id) = setup().await;

        let session = manager.start(user_id, start_params("phone-1")).await.unwrap();
        clock.advance(Duration::minutes(16));

        let ended = manager.end(user_id, session.id).await.unwrap();
        assert_eq!(ended.ended_by, Some(SessionEndedBy::Timeout));

        // Idempotent second end
        let again = manager.end(user_id, session.id).await.unwrap();
        assert_eq!(again.ended_at, ended.ended_at);
    }

    #[tokio::test]
    async fn heartbeat_at_boundary_is_alive_past_it_ends() {
        let (manager, _, clock, user_id) = setup().await;

        let session = manager.start(user_id, start_params("phone-1")).await.unwrap();

        clock.advance(Duration::minutes(15));
        let at_boundary = manager.heartbeat(user_id, session.id, None, None).await.unwrap();
        assert_eq!(at_boundary, HeartbeatOutcome::Alive);

        clock.advance(Duration::minutes(15));
        clock.advance(Duration::seconds(1));
        let past = manager.heartbeat(user_id, session.id, None, None).await.unwrap();
        assert_eq!(past, HeartbeatOutcome::Ended);
    }

    #[tokio::test]
    async fn sweep_expires_only_stale_sessions() {
        let (manager, _, clock, user_id) = setup().await;

        let stale = manager.start(user_id, start_params("phone-1")).await.unwrap();
        clock.advance(Duration::minutes(20));
        let fresh = manager.start(user_id, start_params("phone-2")).await.unwrap();

        let expired = manager.sweep_expired().await.unwrap();
        assert_eq!(expired, 1);

        assert!(manager.get(user_id, stale.id).await.unwrap().ended_at.is_some());
        assert!(manager.get(user_id, fresh.id).await.unwrap().ended_at.is_none());

        // Second sweep finds nothing; finalization is exactly-once
        assert_eq!(manager.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn foreign_sessions_are_invisible() {
        let (manager, repo, clock, user_id) = setup().await;
        let session = manager.start(user_id, start_params("phone-1")).await.unwrap();

        let other = User {
            id: Uuid::from_u128(999),
            org_id: Uuid::from_u128(100),
            email: "other@acme.test".into(),
            username: None,
            password_hash: "x".into(),
            role: Role::User,
            is_active: true,
            email_verified: true,
            last_login_at: None,
            created_at: clock.now(),
        };
        repo.create_user(&other).await.unwrap();

        let err = manager.get(other.id, session.id).await.unwrap_err();
        assert_eq!(err.kind(), "NOT_FOUND");
    }
}
