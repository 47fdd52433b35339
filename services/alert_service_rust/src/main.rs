mod config;

use std::sync::Arc;
use std::time::Duration;

use agrilink_core::db::{self, DbPoolConfig};
use agrilink_core::price_store::PgPriceStore;
use agrilink_core::storage::PgStorage;
use agrilink_core::{
    DetectorConfig, HubConfig, NotificationRepository, PipelineError, PriceChangeDetector,
    RealtimeHub, RepositoryConfig,
};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use config::Config;
use dotenv::dotenv;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting AgriLink alert service...");

    let cfg = Config::from_env()?;
    info!(
        "Config: threshold={}% cooldown={}h ttl={}h interval={:?} retention={}d",
        cfg.alert_threshold_pct,
        cfg.alert_cooldown_hours,
        cfg.notification_ttl_hours,
        cfg.detection_interval,
        cfg.read_retention_days,
    );

    let pool = db::create_pool(&cfg.database_url, &DbPoolConfig::from_env())
        .await
        .context("Failed to connect to database")?;
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Database ping failed")?;
    info!("Connected to database");

    // The hub instance is handed by reference to whatever accepts transport
    // connections; this service owns its lifetime.
    let hub = Arc::new(RealtimeHub::new(HubConfig {
        channel_capacity: cfg.hub_channel_capacity,
        send_timeout: cfg.broadcast_send_timeout,
    }));

    let storage = Arc::new(PgStorage::new(pool.clone()));
    let repository = Arc::new(NotificationRepository::new(
        storage.clone(),
        hub.clone(),
        RepositoryConfig {
            alert_cooldown: ChronoDuration::hours(cfg.alert_cooldown_hours),
            event_cooldown: ChronoDuration::zero(),
            default_ttl: ChronoDuration::hours(cfg.notification_ttl_hours),
        },
    ));

    let prices = Arc::new(PgPriceStore::new(pool.clone()));
    let detector = Arc::new(PriceChangeDetector::new(
        prices,
        storage,
        repository.clone(),
        DetectorConfig {
            threshold: cfg.alert_threshold_pct / 100.0,
            cycle_deadline: cfg.cycle_deadline,
            pair_timeout: cfg.pair_fetch_timeout,
        },
    ));

    {
        let repository = repository.clone();
        let retention = ChronoDuration::days(cfg.read_retention_days);
        let period = cfg.cleanup_interval;
        tokio::spawn(async move {
            cleanup_loop(repository, retention, period).await;
        });
    }

    detection_loop(detector, cfg.detection_interval).await;
    Ok(())
}

/// Periodic trigger for detection cycles. A cycle failure is logged and
/// retried on the next tick; an overlap means the previous cycle is still
/// running and the tick is simply dropped.
async fn detection_loop(detector: Arc<PriceChangeDetector>, period: Duration) {
    info!("Detection loop started (interval {:?})", period);
    let mut ticker = interval(period);

    loop {
        ticker.tick().await;
        match detector.run_cycle().await {
            Ok(report) => {
                if report.alerts_created > 0 || report.pairs_skipped > 0 {
                    info!(
                        "cycle done: pairs={} alerts={} deduped={} skipped={}",
                        report.pairs_seen,
                        report.alerts_created,
                        report.alerts_deduped,
                        report.pairs_skipped
                    );
                }
            }
            Err(PipelineError::Conflict(_)) => {
                debug!("previous cycle still in flight, deferring to next tick");
            }
            Err(e) => {
                error!("detection cycle failed, will retry next tick: {}", e);
            }
        }
    }
}

/// Retention cleanup on its own cadence. Transient store failures are
/// retried with backoff before giving up until the next tick.
async fn cleanup_loop(
    repository: Arc<NotificationRepository>,
    retention: ChronoDuration,
    period: Duration,
) {
    info!("Cleanup loop started (interval {:?})", period);
    let mut ticker = interval(period);

    loop {
        ticker.tick().await;
        match db::with_retry(|| repository.cleanup(retention), 3).await {
            Ok(removed) if removed > 0 => {
                info!("retention cleanup removed {} notifications", removed);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("retention cleanup failed: {}", e);
            }
        }
    }
}
