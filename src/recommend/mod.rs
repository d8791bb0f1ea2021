/// Recommendation dispatch: cache, single-flight, engine fan-out,
/// impression capture.

pub mod buffer;

use crate::auth::Principal;
use crate::cache::{self, keys as cache_keys, Cache};
use crate::clock::{SharedClock, SharedIdGen};
use crate::config::DispatchConfig;
use crate::db::models::Impression;
use crate::engine::{EngineRequest, RecommendationEngine, RecommendationKind};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::repo::Repository;
use buffer::ImpressionBuffer;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const MAX_LIMIT: usize = 200;

/// Caller-facing request
#[derive(Debug, Clone)]
pub struct RecommendRequest {
    pub kind: RecommendationKind,
    pub seed: Option<Uuid>,
    pub limit: usize,
    /// Client-requested deadline; the effective deadline is the smaller of
    /// this and the per-kind default.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedTrack {
    pub track_id: Uuid,
    pub score: f64,
    pub reason: Option<String>,
    pub position: i64,
}

/// A served recommendation list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedTracks {
    pub recommendation_id: Uuid,
    pub kind: RecommendationKind,
    pub tracks: Vec<RankedTrack>,
    pub model_type: String,
    pub model_version: Option<String>,
    pub produced_at: DateTime<Utc>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub stale: bool,
}

impl RankedTracks {
    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.produced_at <= chrono::Duration::from_std(ttl).unwrap_or_default()
    }
}

type FlightResult = Result<RankedTracks, String>;

pub struct RecommendationDispatcher {
    repo: Repository,
    cache: Arc<dyn Cache>,
    engine: Arc<dyn RecommendationEngine>,
    impressions: Arc<ImpressionBuffer>,
    clock: SharedClock,
    ids: SharedIdGen,
    config: DispatchConfig,
    // Held only across map operations, never across the engine call
    flights: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
}

impl RecommendationDispatcher {
    pub fn new(
        repo: Repository,
        cache: Arc<dyn Cache>,
        engine: Arc<dyn RecommendationEngine>,
        impressions: Arc<ImpressionBuffer>,
        clock: SharedClock,
        ids: SharedIdGen,
        config: DispatchConfig,
    ) -> Self {
        Self {
            repo,
            cache,
            engine,
            impressions,
            clock,
            ids,
            config,
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn impression_buffer(&self) -> Arc<ImpressionBuffer> {
        Arc::clone(&self.impressions)
    }

    /// Serve a recommendation request: fresh cache, else single-flight
    /// computation, else stale fallback.
    pub async fn recommend(
        &self,
        principal: &Principal,
        request: RecommendRequest,
    ) -> ApiResult<RankedTracks> {
        if request.limit == 0 || request.limit > MAX_LIMIT {
            return Err(ApiError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }
        if matches!(
            request.kind,
            RecommendationKind::SimilarToTrack | RecommendationKind::RadioSeed
        ) && request.seed.is_none()
        {
            return Err(ApiError::Validation("seed is required for this kind".to_string()));
        }

        let fingerprint = self.fingerprint(principal, &request);
        let cache_key = cache_keys::recommendation(&fingerprint);
        let now = self.clock.now();

        if let Some(entry) = cache::get_json::<RankedTracks>(self.cache.as_ref(), &cache_key).await?
        {
            if entry.is_fresh(now, Duration::from_secs(self.config.cache_ttl_secs)) {
                metrics::CACHE_HITS_TOTAL.with_label_values(&["recommendation"]).inc();
                let mut served = entry;
                served.cached = true;
                return Ok(served);
            }
        }
        metrics::CACHE_MISSES_TOTAL.with_label_values(&["recommendation"]).inc();

        // Single-flight: one computation per fingerprint, concurrent callers
        // attach to the in-flight result.
        let role = {
            let mut flights = self.flights.lock().unwrap();
            match flights.get(&fingerprint) {
                Some(sender) => Flight::Follower(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    flights.insert(fingerprint.clone(), sender.clone());
                    Flight::Leader(sender)
                }
            }
        };

        match role {
            Flight::Follower(mut receiver) => match receiver.recv().await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(message)) => self.stale_or_err(&cache_key, now, message).await,
                Err(_) => {
                    self.stale_or_err(&cache_key, now, "computation abandoned".to_string()).await
                }
            },
            Flight::Leader(sender) => {
                let outcome = self.compute(principal, &request, &cache_key, now).await;

                {
                    let mut flights = self.flights.lock().unwrap();
                    flights.remove(&fingerprint);
                }

                match outcome {
                    Ok(result) => {
                        let _ = sender.send(Ok(result.clone()));
                        Ok(result)
                    }
                    Err(e) => {
                        let _ = sender.send(Err(e.to_string()));
                        self.stale_or_err(&cache_key, now, e.to_string()).await
                    }
                }
            }
        }
    }

    /// One engine round-trip, with a single jittered retry on upstream
    /// failure, then ranking, caching, and impression capture.
    async fn compute(
        &self,
        principal: &Principal,
        request: &RecommendRequest,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> ApiResult<RankedTracks> {
        let engine_request = EngineRequest {
            kind: request.kind,
            user_id: principal.user_id,
            seed: request.seed,
            limit: request.limit,
            model_tier: principal.plan,
        };
        let deadline = self.deadline_for(request.kind, request.timeout_ms);

        let started = std::time::Instant::now();
        let mut response = self.engine.recommend(&engine_request, deadline).await;
        if matches!(response, Err(ApiError::UpstreamUnavailable(_))) {
            let jitter = rand::thread_rng().gen_range(50..250);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            response = self.engine.recommend(&engine_request, deadline).await;
        }
        metrics::ENGINE_REQUEST_DURATION_SECONDS
            .with_label_values(&[request.kind.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let response = match response {
            Ok(response) => {
                metrics::ENGINE_REQUESTS_TOTAL
                    .with_label_values(&[request.kind.as_str(), "ok"])
                    .inc();
                response
            }
            Err(e) => {
                metrics::ENGINE_REQUESTS_TOTAL
                    .with_label_values(&[request.kind.as_str(), "error"])
                    .inc();
                return Err(e);
            }
        };

        let mut scored = response.tracks;
        scored.truncate(request.limit);

        // Deterministic ordering: score desc, then older track, then id
        let meta = self
            .repo
            .track_tiebreak_meta(&scored.iter().map(|t| t.track_id).collect::<Vec<_>>())
            .await?;
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_created = meta.get(&a.track_id);
                    let b_created = meta.get(&b.track_id);
                    a_created.cmp(&b_created)
                })
                .then_with(|| a.track_id.to_string().cmp(&b.track_id.to_string()))
        });

        let recommendation_id = self.ids.mint();
        let tracks: Vec<RankedTrack> = scored
            .into_iter()
            .enumerate()
            .map(|(index, track)| RankedTrack {
                track_id: track.track_id,
                score: track.score,
                reason: track.reason,
                position: index as i64 + 1,
            })
            .collect();

        let result = RankedTracks {
            recommendation_id,
            kind: request.kind,
            tracks,
            model_type: response.model_type,
            model_version: response.model_version,
            produced_at: now,
            cached: false,
            stale: false,
        };

        // Keep entries for the stale horizon; freshness is judged from
        // produced_at on read.
        cache::set_json(
            self.cache.as_ref(),
            cache_key,
            &result,
            Some(Duration::from_secs(self.config.stale_while_error_secs)),
        )
        .await?;

        // Impression capture must not delay the caller
        let impressions: Vec<Impression> = result
            .tracks
            .iter()
            .map(|track| Impression {
                id: self.ids.mint(),
                user_id: principal.user_id,
                track_id: track.track_id,
                recommendation_id,
                model_type: result.model_type.clone(),
                model_version: result.model_version.clone(),
                score: track.score,
                position: track.position,
                context: Some(request.kind.as_str().to_string()),
                shown_at: now,
                clicked: false,
                played: false,
                liked: false,
            })
            .collect();
        self.impressions.push_batch(impressions);

        Ok(result)
    }

    /// Stale-while-error: serve an expired entry inside the stale horizon.
    async fn stale_or_err(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
        message: String,
    ) -> ApiResult<RankedTracks> {
        if let Some(entry) = cache::get_json::<RankedTracks>(self.cache.as_ref(), cache_key).await?
        {
            if entry.is_fresh(now, Duration::from_secs(self.config.stale_while_error_secs)) {
                metrics::STALE_SERVED_TOTAL.inc();
                let mut served = entry;
                served.cached = true;
                served.stale = true;
                return Ok(served);
            }
        }
        Err(ApiError::UpstreamUnavailable(message))
    }

    fn deadline_for(&self, kind: RecommendationKind, client_timeout_ms: Option<u64>) -> Duration {
        let default = match kind {
            RecommendationKind::UserPersonal | RecommendationKind::SimilarToTrack => {
                self.config.timeout_personal_ms
            }
            RecommendationKind::DailyMix | RecommendationKind::RadioSeed => self.config.timeout_mix_ms,
            RecommendationKind::TasteProfile => self.config.timeout_profile_ms,
        };
        let millis = match client_timeout_ms {
            Some(requested) if requested > 0 => requested.min(default),
            _ => default,
        };
        Duration::from_millis(millis)
    }

    /// Deterministic request identity for caching and single-flight.
    fn fingerprint(&self, principal: &Principal, request: &RecommendRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.kind.as_str().as_bytes());
        hasher.update(principal.user_id.as_bytes());
        if let Some(seed) = request.seed {
            hasher.update(seed.as_bytes());
        }
        hasher.update(request.limit.to_le_bytes());
        hasher.update(principal.plan.as_str().as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

enum Flight {
    Leader(broadcast::Sender<FlightResult>),
    Follower(broadcast::Receiver<FlightResult>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::cache::MemoryCache;
    use crate::clock::{ManualClock, SeqIdGen};
    use crate::db::models::{Organization, Plan, Role, Track, User};
    use crate::engine::{EngineResponse, ScoredTrack, StaticEngine};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn config() -> DispatchConfig {
        DispatchConfig {
            cache_ttl_secs: 300,
            stale_while_error_secs: 3_600,
            impression_buffer_capacity: 100,
            impression_flush_interval_ms: 10,
        }
    }

    struct Fixture {
        repo: Repository,
        cache: Arc<MemoryCache>,
        clock: Arc<ManualClock>,
        principal: Principal,
        tracks: Vec<Uuid>,
    }

    async fn setup() -> Fixture {
        let pool = crate::db::create_memory_pool().await.unwrap();
        let repo = Repository::new(pool);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap(),
        ));
        let now = clock.now();

        let org = Organization {
            id: Uuid::from_u128(1),
            name: "Acme".into(),
            slug: "acme".into(),
            plan: Plan::Free,
            max_users: 5,
            max_tracks: 100,
            feature_overrides: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        repo.create_organization(&org).await.unwrap();

        let user = User {
            id: Uuid::from_u128(2),
            org_id: org.id,
            email: "fan@acme.test".into(),
            username: None,
            password_hash: "x".into(),
            role: Role::User,
            is_active: true,
            email_verified: true,
            last_login_at: None,
            created_at: now,
        };
        repo.create_user(&user).await.unwrap();

        // T1 older than T2; T3 newest
        let mut tracks = Vec::new();
        for (n, age_mins) in [(11u128, 300i64), (12, 200), (13, 100)] {
            let track = Track {
                id: Uuid::from_u128(n),
                org_id: org.id,
                title: format!("T{}", n - 10),
                artist: None,
                genre: None,
                duration_ms: 180_000,
                created_at: now - chrono::Duration::minutes(age_mins),
            };
            repo.create_track(&track).await.unwrap();
            tracks.push(track.id);
        }

        let principal = Principal {
            user_id: user.id,
            org_id: org.id,
            plan: Plan::Free,
            scopes: vec!["*".into()],
            auth_method: AuthMethod::SessionToken,
            key_id: None,
            key_limits: None,
            feature_overrides: HashMap::new(),
        };

        Fixture {
            repo,
            cache: Arc::new(MemoryCache::new()),
            clock,
            principal,
            tracks,
        }
    }

    fn dispatcher(f: &Fixture, engine: Arc<dyn RecommendationEngine>) -> RecommendationDispatcher {
        RecommendationDispatcher::new(
            f.repo.clone(),
            f.cache.clone(),
            engine,
            Arc::new(ImpressionBuffer::new(100)),
            f.clock.clone(),
            Arc::new(SeqIdGen::default()),
            config(),
        )
    }

    fn personal(limit: usize) -> RecommendRequest {
        RecommendRequest {
            kind: RecommendationKind::UserPersonal,
            seed: None,
            limit,
            timeout_ms: None,
        }
    }

    fn response(tracks: Vec<(Uuid, f64)>) -> EngineResponse {
        EngineResponse {
            tracks: tracks
                .into_iter()
                .map(|(track_id, score)| ScoredTrack { track_id, score, reason: None })
                .collect(),
            model_type: "collaborative".into(),
            model_version: Some("v3".into()),
        }
    }

    #[tokio::test]
    async fn cold_request_ranks_with_tiebreak_and_buffers_impressions() {
        let f = setup().await;
        // T1 and T2 tie at 0.9; T1 is older and must win
        let engine = Arc::new(StaticEngine::always(response(vec![
            (f.tracks[1], 0.9),
            (f.tracks[0], 0.9),
            (f.tracks[2], 0.5),
        ])));
        let dispatcher = dispatcher(&f, engine);

        let result = dispatcher.recommend(&f.principal, personal(3)).await.unwrap();

        let order: Vec<_> = result.tracks.iter().map(|t| t.track_id).collect();
        assert_eq!(order, vec![f.tracks[0], f.tracks[1], f.tracks[2]]);
        assert_eq!(
            result.tracks.iter().map(|t| t.position).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let buffered = dispatcher.impression_buffer().drain(10);
        assert_eq!(buffered.len(), 3);
        assert_eq!(buffered[0].recommendation_id, result.recommendation_id);
        assert_eq!(buffered[2].position, 3);
    }

    #[tokio::test]
    async fn fresh_cache_skips_engine() {
        let f = setup().await;
        let engine = Arc::new(StaticEngine::always(response(vec![(f.tracks[0], 0.8)])));
        let dispatcher = dispatcher(&f, engine.clone());

        let first = dispatcher.recommend(&f.principal, personal(1)).await.unwrap();
        let second = dispatcher.recommend(&f.principal, personal(1)).await.unwrap();

        assert_eq!(engine.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.recommendation_id, second.recommendation_id);
    }

    #[tokio::test]
    async fn stale_entry_served_when_engine_fails() {
        let f = setup().await;
        let engine = Arc::new(StaticEngine::new(vec![
            Ok(response(vec![(f.tracks[0], 0.8)])),
            Err(ApiError::UpstreamUnavailable("down".into())),
        ]));
        let dispatcher = dispatcher(&f, engine);

        let first = dispatcher.recommend(&f.principal, personal(1)).await.unwrap();

        // Past the fresh TTL, inside the stale horizon
        f.clock.advance(chrono::Duration::minutes(10));
        let second = dispatcher.recommend(&f.principal, personal(1)).await.unwrap();

        assert!(second.stale);
        assert_eq!(second.recommendation_id, first.recommendation_id);
    }

    #[tokio::test]
    async fn upstream_error_without_cache_surfaces_after_retry() {
        let f = setup().await;
        let engine = Arc::new(StaticEngine::unavailable());
        let dispatcher = dispatcher(&f, engine.clone());

        let err = dispatcher.recommend(&f.principal, personal(1)).await.unwrap_err();
        assert_eq!(err.kind(), "UPSTREAM_UNAVAILABLE");
        // Initial call plus one retry
        assert_eq!(engine.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn seed_is_required_for_similar() {
        let f = setup().await;
        let engine = Arc::new(StaticEngine::always(response(vec![])));
        let dispatcher = dispatcher(&f, engine);

        let err = dispatcher
            .recommend(
                &f.principal,
                RecommendRequest {
                    kind: RecommendationKind::SimilarToTrack,
                    seed: None,
                    limit: 10,
                    timeout_ms: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_FAILED");
    }

    /// Engine that blocks until released, counting concurrent executions.
    struct GatedEngine {
        release: tokio::sync::Semaphore,
        calls: std::sync::atomic::AtomicUsize,
        tracks: Vec<(Uuid, f64)>,
    }

    #[async_trait]
    impl RecommendationEngine for GatedEngine {
        async fn recommend(
            &self,
            _request: &EngineRequest,
            _deadline: Duration,
        ) -> ApiResult<EngineResponse> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _permit = self.release.acquire().await.unwrap();
            Ok(response(self.tracks.clone()))
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_flight() {
        let f = setup().await;
        let engine = Arc::new(GatedEngine {
            release: tokio::sync::Semaphore::new(0),
            calls: std::sync::atomic::AtomicUsize::new(0),
            tracks: vec![(f.tracks[0], 0.8)],
        });
        let dispatcher = Arc::new(dispatcher(&f, engine.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = Arc::clone(&dispatcher);
            let principal = f.principal.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.recommend(&principal, personal(1)).await
            }));
        }

        // Give all callers time to attach, then release the leader
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.release.add_permits(1);

        let mut ids = Vec::new();
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            ids.push(result.recommendation_id);
        }

        assert_eq!(engine.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
