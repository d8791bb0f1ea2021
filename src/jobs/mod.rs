/// Background job loops: session expiry sweep and impression flushing.
///
/// Each loop watches a shutdown signal and drains its queue before exiting;
/// the caller bounds the drain with the shutdown deadline.
use crate::context::AppContext;
use crate::metrics;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

const FLUSH_BATCH: usize = 500;

pub struct JobScheduler {
    context: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Spawn all background jobs. Returns handles so shutdown can await the
    /// drains.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Starting background jobs");

        vec![
            tokio::spawn(Self::session_sweep_job(
                Arc::clone(&self.context),
                shutdown.clone(),
            )),
            tokio::spawn(Self::impression_flush_job(Arc::clone(&self.context), shutdown)),
        ]
    }

    /// Expire idle listening sessions on a fixed cadence.
    async fn session_sweep_job(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(ctx.config.sessions.sweep_interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match ctx.sessions.sweep_expired().await {
                        Ok(count) => {
                            if count > 0 {
                                info!("Expired {} idle sessions", count);
                            }
                            metrics::BACKGROUND_JOBS_TOTAL
                                .with_label_values(&["session_sweep", "ok"])
                                .inc();
                        }
                        Err(e) => {
                            error!("Session sweep failed: {}", e);
                            metrics::BACKGROUND_JOBS_TOTAL
                                .with_label_values(&["session_sweep", "error"])
                                .inc();
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Session sweep stopping");
                    break;
                }
            }
        }
    }

    /// Persist buffered impressions. On shutdown, drains whatever is queued
    /// before returning.
    async fn impression_flush_job(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
        let buffer = ctx.dispatcher.impression_buffer();
        let mut ticker = interval(Duration::from_millis(
            ctx.config.dispatch.impression_flush_interval_ms,
        ));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    Self::flush_impressions(&ctx).await;
                }
                _ = buffer.wait() => {
                    Self::flush_impressions(&ctx).await;
                }
                _ = shutdown.changed() => {
                    info!("Impression flusher draining before exit");
                    while !buffer.is_empty() {
                        Self::flush_impressions(&ctx).await;
                    }
                    break;
                }
            }
        }
    }

    async fn flush_impressions(ctx: &AppContext) {
        let batch = ctx.dispatcher.impression_buffer().drain(FLUSH_BATCH);
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let mut failed = 0usize;
        for impression in batch {
            if let Err(e) = ctx.repo.insert_impression(&impression).await {
                failed += 1;
                error!(impression_id = %impression.id, "impression write failed: {}", e);
            }
        }

        if failed == 0 {
            tracing::debug!("Flushed {} impressions", count);
            metrics::BACKGROUND_JOBS_TOTAL
                .with_label_values(&["impression_flush", "ok"])
                .inc();
        } else {
            metrics::BACKGROUND_JOBS_TOTAL
                .with_label_values(&["impression_flush", "error"])
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::{ManualClock, SeqIdGen};
    use crate::config::ServerConfig;
    use crate::db::models::{Organization, Plan, Role, User};
    use crate::engine::StaticEngine;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use uuid::Uuid;

    async fn context() -> Arc<AppContext> {
        let pool = crate::db::create_memory_pool().await.unwrap();
        let mut config = ServerConfig::test_defaults();
        config.dispatch.impression_flush_interval_ms = 10;

        let ctx = AppContext::assemble(
            config,
            pool,
            Arc::new(MemoryCache::new()),
            Arc::new(StaticEngine::unavailable()),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap())),
            Arc::new(SeqIdGen::default()),
        )
        .unwrap();

        let now = ctx.clock.now();
        let org = Organization {
            id: Uuid::from_u128(1),
            name: "Acme".into(),
            slug: "acme".into(),
            plan: Plan::Free,
            max_users: 1,
            max_tracks: 10,
            feature_overrides: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        ctx.repo.create_organization(&org).await.unwrap();
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
        ctx.repo.create_user(&user).await.unwrap();

        Arc::new(ctx)
    }

    #[tokio::test]
    async fn flusher_drains_buffer_on_shutdown() {
        let ctx = context().await;
        let buffer = ctx.dispatcher.impression_buffer();
        let now = ctx.clock.now();

        buffer.push_batch(
            (1..=7u128)
                .map(|n| crate::db::models::Impression {
                    id: Uuid::from_u128(1000 + n),
                    user_id: Uuid::from_u128(2),
                    track_id: Uuid::from_u128(n),
                    recommendation_id: Uuid::from_u128(99),
                    model_type: "cf".into(),
                    model_version: None,
                    score: 0.5,
                    position: n as i64,
                    context: None,
                    shown_at: now,
                    clicked: false,
                    played: false,
                    liked: false,
                })
                .collect(),
        );

        let (tx, rx) = watch::channel(false);
        let scheduler = JobScheduler::new(Arc::clone(&ctx));
        let handles = scheduler.start(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        }

        assert!(buffer.is_empty());
        let stored = ctx
            .repo
            .impressions_for_recommendation(Uuid::from_u128(99), Uuid::from_u128(2))
            .await
            .unwrap();
        assert_eq!(stored.len(), 7);
    }
}
