use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunetrail::{config::ServerConfig, context::AppContext, error::ApiResult, jobs, server};

#[tokio::main]
async fn main() -> ApiResult<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunetrail=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let shutdown_deadline =
        std::time::Duration::from_secs(config.service.shutdown_deadline_secs);

    let ctx = Arc::new(AppContext::new(config).await?);

    // Background loops with an explicit shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = jobs::JobScheduler::new(Arc::clone(&ctx));
    let job_handles = scheduler.start(shutdown_rx);

    server::serve((*ctx).clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    // Drain background queues, bounded by the shutdown deadline
    let _ = shutdown_tx.send(true);
    for handle in job_handles {
        if tokio::time::timeout(shutdown_deadline, handle).await.is_err() {
            warn!("Background job did not drain before the shutdown deadline");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
