/// Cross-component scenarios wired through the real context: credential
/// verification, key rotation grace, quota enforcement, and the
/// recommendation-to-impression loop, all on in-memory adapters.
use chrono::{Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tunetrail::{
    auth::AuthMethod,
    cache::MemoryCache,
    clock::{Clock, ManualClock, SeqIdGen},
    config::ServerConfig,
    context::AppContext,
    db::models::{Environment, Organization, Plan, Role, Track, User},
    engine::{EngineResponse, ScoredTrack, StaticEngine},
    gate::plans,
    keys::IssueKeyParams,
    recommend::RecommendRequest,
};
use uuid::Uuid;

struct Harness {
    ctx: AppContext,
    clock: Arc<ManualClock>,
    user: User,
    org: Organization,
}

async fn harness(plan: Plan, engine: Arc<StaticEngine>) -> Harness {
    let pool = tunetrail::db::create_memory_pool().await.unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap(),
    ));

    let ctx = AppContext::assemble(
        ServerConfig::test_defaults(),
        pool,
        Arc::new(MemoryCache::new()),
        engine,
        clock.clone(),
        Arc::new(SeqIdGen::default()),
    )
    .unwrap();

    let now = clock.now();
    let org = Organization {
        id: Uuid::from_u128(1),
        name: "Acme Records".into(),
        slug: "acme-records".into(),
        plan,
        max_users: 10,
        max_tracks: 1_000,
        feature_overrides: HashMap::new(),
        created_at: now,
        updated_at: now,
    };
    ctx.repo.create_organization(&org).await.unwrap();

    let user = User {
        id: Uuid::from_u128(2),
        org_id: org.id,
        email: "listener@acme.test".into(),
        username: Some("listener".into()),
        password_hash: tunetrail::auth::hashing::hash_secret("hunter2hunter2").unwrap(),
        role: Role::User,
        is_active: true,
        email_verified: true,
        last_login_at: None,
        created_at: now,
    };
    ctx.repo.create_user(&user).await.unwrap();

    Harness { ctx, clock, user, org }
}

async fn seed_tracks(h: &Harness, specs: &[(u128, i64)]) -> Vec<Uuid> {
    let now = h.clock.now();
    let mut ids = Vec::new();
    for (n, age_mins) in specs {
        let track = Track {
            id: Uuid::from_u128(*n),
            org_id: h.org.id,
            title: format!("Track {}", n),
            artist: Some("Artist".into()),
            genre: Some("electronic".into()),
            duration_ms: 240_000,
            created_at: now - Duration::minutes(*age_mins),
        };
        h.ctx.repo.create_track(&track).await.unwrap();
        ids.push(track.id);
    }
    ids
}

fn engine_with(tracks: Vec<(Uuid, f64)>) -> Arc<StaticEngine> {
    Arc::new(StaticEngine::always(EngineResponse {
        tracks: tracks
            .into_iter()
            .map(|(track_id, score)| ScoredTrack { track_id, score, reason: None })
            .collect(),
        model_type: "collaborative".into(),
        model_version: Some("v3".into()),
    }))
}

#[tokio::test]
async fn session_token_roundtrip_resolves_principal() {
    let h = harness(Plan::Starter, engine_with(vec![])).await;

    let (token, _) = h
        .ctx
        .verifier
        .signer()
        .issue(h.user.id, h.clock.now())
        .unwrap();

    let principal = h.ctx.verifier.verify(&token, None).await.unwrap();
    assert_eq!(principal.user_id, h.user.id);
    assert_eq!(principal.org_id, h.org.id);
    assert_eq!(principal.plan, Plan::Starter);
    assert_eq!(principal.auth_method, AuthMethod::SessionToken);
    assert!(principal.has_scope("write:interactions"));
}

#[tokio::test]
async fn expired_session_token_is_rejected() {
    let h = harness(Plan::Free, engine_with(vec![])).await;
    let (token, _) = h
        .ctx
        .verifier
        .signer()
        .issue(h.user.id, h.clock.now())
        .unwrap();

    h.clock.advance(Duration::minutes(31));
    let err = h.ctx.verifier.verify(&token, None).await.unwrap_err();
    assert_eq!(err.kind(), "EXPIRED_CREDENTIAL");
}

fn issue_params(name: &str) -> IssueKeyParams {
    IssueKeyParams {
        name: name.into(),
        scopes: vec!["read:recommendations".into()],
        environment: Environment::Production,
        expires_in_days: None,
        limit_per_minute: 60,
        limit_per_hour: 1_000,
        limit_per_day: 10_000,
        ip_allowlist: None,
    }
}

#[tokio::test]
async fn api_key_secret_authenticates_and_is_stored_hashed() {
    let h = harness(Plan::Pro, engine_with(vec![])).await;

    let (key, secret) = h
        .ctx
        .keys
        .issue(h.user.id, h.org.id, issue_params("ci"))
        .await
        .unwrap();

    assert!(secret.starts_with("tt_"));
    assert_eq!(secret.len(), 46);
    // The stored row never contains the secret
    assert!(!key.key_hash.contains(&secret[3..]));
    assert_eq!(key.redacted_key(), format!("{}•••", key.key_prefix));

    let principal = h.ctx.verifier.verify(&secret, None).await.unwrap();
    assert_eq!(principal.auth_method, AuthMethod::ApiKey);
    assert_eq!(principal.key_id, Some(key.id));
    assert!(principal.has_scope("read:recommendations"));
    assert!(!principal.has_scope("manage:keys"));
}

#[tokio::test]
async fn rotation_grace_keeps_old_key_alive_for_24h() {
    let h = harness(Plan::Pro, engine_with(vec![])).await;

    let (old_key, old_secret) = h
        .ctx
        .keys
        .issue(h.user.id, h.org.id, issue_params("rotating"))
        .await
        .unwrap();
    let (new_key, new_secret, rotated_from) =
        h.ctx.keys.rotate(old_key.id, h.user.id).await.unwrap();
    assert_eq!(rotated_from, old_key.id);
    assert_ne!(new_key.id, old_key.id);

    // Inside the grace window both authenticate
    h.clock.advance(Duration::hours(23));
    assert!(h.ctx.verifier.verify(&old_secret, None).await.is_ok());
    assert!(h.ctx.verifier.verify(&new_secret, None).await.is_ok());

    // Past it only the new key survives
    h.clock.advance(Duration::hours(2));
    let err = h.ctx.verifier.verify(&old_secret, None).await.unwrap_err();
    assert_eq!(err.kind(), "REVOKED_CREDENTIAL");
    assert!(h.ctx.verifier.verify(&new_secret, None).await.is_ok());
}

#[tokio::test]
async fn revoked_key_never_authenticates_again() {
    let h = harness(Plan::Pro, engine_with(vec![])).await;
    let (key, secret) = h
        .ctx
        .keys
        .issue(h.user.id, h.org.id, issue_params("doomed"))
        .await
        .unwrap();

    h.ctx.keys.revoke(key.id, h.user.id).await.unwrap();

    let err = h.ctx.verifier.verify(&secret, None).await.unwrap_err();
    assert_eq!(err.kind(), "REVOKED_CREDENTIAL");
}

#[tokio::test]
async fn ip_allowlist_blocks_other_addresses() {
    let h = harness(Plan::Pro, engine_with(vec![])).await;
    let mut params = issue_params("pinned");
    params.ip_allowlist = Some(vec!["10.0.0.7".into()]);
    let (_, secret) = h.ctx.keys.issue(h.user.id, h.org.id, params).await.unwrap();

    let allowed = h
        .ctx
        .verifier
        .verify(&secret, Some("10.0.0.7".parse().unwrap()))
        .await;
    assert!(allowed.is_ok());

    let denied = h
        .ctx
        .verifier
        .verify(&secret, Some("10.0.0.8".parse().unwrap()))
        .await
        .unwrap_err();
    assert_eq!(denied.kind(), "IP_NOT_ALLOWED");

    let missing = h.ctx.verifier.verify(&secret, None).await.unwrap_err();
    assert_eq!(missing.kind(), "IP_NOT_ALLOWED");
}

#[tokio::test]
async fn free_plan_is_gated_out_of_daily_mix() {
    let h = harness(Plan::Free, engine_with(vec![])).await;
    let (token, _) = h
        .ctx
        .verifier
        .signer()
        .issue(h.user.id, h.clock.now())
        .unwrap();
    let principal = h.ctx.verifier.verify(&token, None).await.unwrap();

    let err = h
        .ctx
        .gate
        .check(&principal, &plans::DAILY_MIX)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PLAN_UPGRADE_REQUIRED");
    assert_eq!(err.status().as_u16(), 402);
}

#[tokio::test]
async fn cold_recommendation_persists_impressions_via_flusher() {
    // Engine ties T1/T2 at 0.9; T1 is older so it ranks first
    let h = harness(Plan::Free, engine_with(vec![])).await;
    let tracks = seed_tracks(&h, &[(11, 300), (12, 200), (13, 100)]).await;
    let engine = engine_with(vec![
        (tracks[1], 0.9),
        (tracks[0], 0.9),
        (tracks[2], 0.5),
    ]);

    // Rewire with the scripted engine
    let pool = h.ctx.db.clone();
    let ctx = AppContext::assemble(
        ServerConfig::test_defaults(),
        pool,
        Arc::new(MemoryCache::new()),
        engine,
        h.clock.clone(),
        Arc::new(SeqIdGen::default()),
    )
    .unwrap();

    let (token, _) = ctx.verifier.signer().issue(h.user.id, h.clock.now()).unwrap();
    let principal = ctx.verifier.verify(&token, None).await.unwrap();

    let result = ctx
        .dispatcher
        .recommend(
            &principal,
            RecommendRequest {
                kind: tunetrail::engine::RecommendationKind::UserPersonal,
                seed: None,
                limit: 3,
                timeout_ms: None,
            },
        )
        .await
        .unwrap();

    let order: Vec<_> = result.tracks.iter().map(|t| t.track_id).collect();
    assert_eq!(order, vec![tracks[0], tracks[1], tracks[2]]);

    // Drain the buffer the way the background flusher does
    let buffered = ctx.dispatcher.impression_buffer().drain(100);
    assert_eq!(buffered.len(), 3);
    for impression in &buffered {
        ctx.repo.insert_impression(impression).await.unwrap();
    }

    let stored = ctx
        .repo
        .impressions_for_recommendation(result.recommendation_id, h.user.id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(
        stored.iter().map(|i| i.position).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn feedback_closes_the_loop_idempotently() {
    let h = harness(Plan::Starter, engine_with(vec![])).await;
    let tracks = seed_tracks(&h, &[(21, 10)]).await;
    let engine = engine_with(vec![(tracks[0], 0.7)]);

    let ctx = AppContext::assemble(
        ServerConfig::test_defaults(),
        h.ctx.db.clone(),
        Arc::new(MemoryCache::new()),
        engine,
        h.clock.clone(),
        Arc::new(SeqIdGen::default()),
    )
    .unwrap();

    let (token, _) = ctx.verifier.signer().issue(h.user.id, h.clock.now()).unwrap();
    let principal = ctx.verifier.verify(&token, None).await.unwrap();

    let result = ctx
        .dispatcher
        .recommend(
            &principal,
            RecommendRequest {
                kind: tunetrail::engine::RecommendationKind::UserPersonal,
                seed: None,
                limit: 1,
                timeout_ms: None,
            },
        )
        .await
        .unwrap();

    for impression in ctx.dispatcher.impression_buffer().drain(10) {
        ctx.repo.insert_impression(&impression).await.unwrap();
    }

    let first = ctx
        .ingestor
        .record_feedback(
            &principal,
            result.recommendation_id,
            tunetrail::ingest::FeedbackSignal::Played,
            None,
        )
        .await
        .unwrap();
    let second = ctx
        .ingestor
        .record_feedback(
            &principal,
            result.recommendation_id,
            tunetrail::ingest::FeedbackSignal::Played,
            None,
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);

    let impressions = ctx
        .repo
        .impressions_for_recommendation(result.recommendation_id, h.user.id)
        .await
        .unwrap();
    assert!(impressions[0].played);
    assert!(impressions[0].clicked);
}

#[tokio::test]
async fn plan_downgrade_mid_window_applies_at_the_boundary() {
    let h = harness(Plan::Pro, engine_with(vec![])).await;
    let (token, _) = h
        .ctx
        .verifier
        .signer()
        .issue(h.user.id, h.clock.now())
        .unwrap();
    let pro = h.ctx.verifier.verify(&token, None).await.unwrap();

    // Consume well past the starter cap while the org is still Pro
    for _ in 0..150 {
        h.ctx.gate.check(&pro, &plans::AUDIO_ANALYZE).await.unwrap();
    }

    h.ctx
        .repo
        .update_organization_plan(h.org.id, Plan::Starter, h.clock.now())
        .await
        .unwrap();
    let downgraded = h.ctx.verifier.verify(&token, None).await.unwrap();
    assert_eq!(downgraded.plan, Plan::Starter);

    // Mid-window the caller keeps the limit recorded at window start;
    // nothing is refunded, but the lower cap waits for the boundary
    let info = h
        .ctx
        .gate
        .check(&downgraded, &plans::AUDIO_ANALYZE)
        .await
        .unwrap()
        .expect("metered window");
    assert_eq!(info.limit, 1_000);

    // From the next UTC day a fresh counter runs under the starter limit
    h.clock.advance(Duration::days(1));
    for _ in 0..100 {
        h.ctx
            .gate
            .check(&downgraded, &plans::AUDIO_ANALYZE)
            .await
            .unwrap();
    }
    let err = h
        .ctx
        .gate
        .check(&downgraded, &plans::AUDIO_ANALYZE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "QUOTA_EXCEEDED");
}

#[tokio::test]
async fn starter_audio_quota_denies_the_101st_call() {
    let h = harness(Plan::Starter, engine_with(vec![])).await;
    let (token, _) = h
        .ctx
        .verifier
        .signer()
        .issue(h.user.id, h.clock.now())
        .unwrap();
    let principal = h.ctx.verifier.verify(&token, None).await.unwrap();

    for _ in 0..100 {
        h.ctx
            .gate
            .check(&principal, &plans::AUDIO_ANALYZE)
            .await
            .unwrap();
    }

    let err = h
        .ctx
        .gate
        .check(&principal, &plans::AUDIO_ANALYZE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "QUOTA_EXCEEDED");
    assert_eq!(err.status().as_u16(), 429);
}
