/// Application context and dependency injection
use crate::{
    auth::{tokens::TokenSigner, CredentialVerifier},
    cache::{Cache, MemoryCache, RedisCache},
    clock::{SharedClock, SharedIdGen, SystemClock, UuidGen},
    config::ServerConfig,
    db,
    engine::{HttpEngine, RecommendationEngine},
    error::ApiResult,
    gate::{public::PublicRateLimiter, QuotaGate},
    ingest::InteractionIngestor,
    keys::ApiKeyManager,
    recommend::{buffer::ImpressionBuffer, RecommendationDispatcher},
    repo::Repository,
    sessions::SessionManager,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub repo: Repository,
    pub cache: Arc<dyn Cache>,
    pub verifier: CredentialVerifier,
    pub gate: Arc<QuotaGate>,
    pub sessions: SessionManager,
    pub ingestor: InteractionIngestor,
    pub dispatcher: Arc<RecommendationDispatcher>,
    pub keys: ApiKeyManager,
    pub public_limiter: PublicRateLimiter,
    pub clock: SharedClock,
    pub ids: SharedIdGen,
}

impl AppContext {
    /// Create a production context from configuration
    pub async fn new(config: ServerConfig) -> ApiResult<Self> {
        config.validate()?;

        let pool = db::create_pool(
            &config.storage.database,
            db::DatabaseOptions {
                max_connections: config.storage.max_connections,
                enable_wal: true,
            },
        )
        .await?;
        db::run_migrations(&pool).await?;
        db::test_connection(&pool).await?;

        let cache: Arc<dyn Cache> = match &config.cache.redis_url {
            Some(url) => Arc::new(RedisCache::connect(url, &config.cache.key_prefix).await?),
            None => {
                tracing::info!("No Redis configured; using in-process cache");
                Arc::new(MemoryCache::new())
            }
        };

        let engine: Arc<dyn RecommendationEngine> =
            Arc::new(HttpEngine::new(&config.engine.base_url));

        Self::assemble(
            config,
            pool,
            cache,
            engine,
            Arc::new(SystemClock),
            Arc::new(UuidGen),
        )
    }

    /// Wire the component graph from explicit parts. Tests inject manual
    /// clocks, scripted engines, and in-memory adapters here.
    pub fn assemble(
        config: ServerConfig,
        pool: SqlitePool,
        cache: Arc<dyn Cache>,
        engine: Arc<dyn RecommendationEngine>,
        clock: SharedClock,
        ids: SharedIdGen,
    ) -> ApiResult<Self> {
        let repo = Repository::new(pool.clone());

        let signer = TokenSigner::new(
            &config.auth.jwt_secret,
            config.auth.access_token_expire_minutes,
        );
        let verifier = CredentialVerifier::new(repo.clone(), clock.clone(), signer);

        let gate = Arc::new(QuotaGate::new(cache.clone(), clock.clone()));

        let sessions = SessionManager::new(
            repo.clone(),
            cache.clone(),
            clock.clone(),
            ids.clone(),
            config.sessions.idle_timeout_secs,
        );

        let ingestor =
            InteractionIngestor::new(repo.clone(), cache.clone(), clock.clone(), ids.clone());

        let impressions = Arc::new(ImpressionBuffer::new(
            config.dispatch.impression_buffer_capacity,
        ));
        let dispatcher = Arc::new(RecommendationDispatcher::new(
            repo.clone(),
            cache.clone(),
            engine,
            impressions,
            clock.clone(),
            ids.clone(),
            config.dispatch.clone(),
        ));

        let keys = ApiKeyManager::new(
            repo.clone(),
            clock.clone(),
            ids.clone(),
            config.auth.key_rotation_grace_hours,
        );

        let public_limiter = PublicRateLimiter::new(config.auth.public_requests_per_minute);

        Ok(Self {
            config: Arc::new(config),
            db: pool,
            repo,
            cache,
            verifier,
            gate,
            sessions,
            ingestor,
            dispatcher,
            keys,
            public_limiter,
            clock,
            ids,
        })
    }
}
