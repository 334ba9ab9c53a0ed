//! Quotapay Background Worker
//!
//! Handles scheduled repair passes:
//! - Missing ledger credits for already-credited intents (every 5 minutes)
//! - Divergent cached quota balances (hourly)
//! - Health check heartbeat (every 5 minutes)
//!
//! Every job is fail-soft: errors are logged and the scheduler keeps
//! running.

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use quotapay_payments::{PgQuotaStore, QuotaService, QuotaStore};
use quotapay_shared::create_pool;

/// Scan for cached balances that no longer match the ledger sum and
/// recompute them. Returns how many users were repaired.
async fn refresh_divergent_caches(store: &PgQuotaStore) -> u32 {
    let divergent = match store.users_with_divergent_cache().await {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "Failed to scan for divergent balance caches");
            return 0;
        }
    };

    let mut repaired = 0u32;
    for user_id in divergent {
        match store.refresh_cached_balance(user_id).await {
            Ok(balance) => {
                warn!(
                    user_id = %user_id,
                    balance = balance,
                    "Repaired divergent cached quota balance"
                );
                repaired += 1;
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to refresh cached balance");
            }
        }
    }
    repaired
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Quotapay Worker");

    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    // The repair passes only need the store and the reconciler; if the
    // provider gateway isn't configured, run in minimal mode.
    let service = match QuotaService::from_env(pool.clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            warn!(error = %e, "Failed to create quota service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };
    let store = Arc::new(PgQuotaStore::new(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Repair missing ledger credits (every 5 minutes)
    // Backstops the rare case where the success transition landed but the
    // ledger append did not and no webhook redelivery arrived.
    let repair_service = service.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let service = repair_service.clone();
            Box::pin(async move {
                match service.reconciler.repair_missing_credits().await {
                    Ok(0) => info!("Credit repair pass complete, nothing to repair"),
                    Ok(repaired) => {
                        warn!(repaired = repaired, "Credit repair pass inserted missing entries")
                    }
                    Err(e) => error!(error = %e, "Credit repair pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Missing credit repair (every 5 minutes)");

    // Job 2: Refresh divergent cached balances (hourly)
    let cache_store = store.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let store = cache_store.clone();
            Box::pin(async move {
                let repaired = refresh_divergent_caches(&store).await;
                info!(repaired = repaired, "Balance cache refresh complete");
            })
        })?)
        .await?;
    info!("Scheduled: Balance cache refresh (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Quotapay Worker started successfully with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
