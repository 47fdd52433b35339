//! Periodic price-movement detection.
//!
//! Each cycle walks the tracked (crop, location) pairs, compares the latest
//! observation against the stored baseline, and commits alert-worthy moves
//! through the repository. Per-pair failures are logged and skipped; only a
//! store-wide failure aborts the cycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{PairKey, PriceAlertPayload, PricePoint};
use crate::price_store::PriceStore;
use crate::repository::NotificationRepository;
use crate::storage::{InsertOutcome, NotificationStorage};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Alert threshold as a fraction of the baseline (0.05 = 5%).
    pub threshold: f64,
    /// Whole-cycle deadline.
    pub cycle_deadline: Duration,
    /// Per-pair fetch patience. An expired fetch is skipped, not retried
    /// within the cycle.
    pub pair_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            cycle_deadline: Duration::from_secs(60),
            pair_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters from one detection cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub pairs_seen: usize,
    pub alerts_created: usize,
    pub alerts_deduped: usize,
    pub pairs_skipped: usize,
}

enum PairOutcome {
    Alerted,
    Deduped,
    Quiet,
}

pub struct PriceChangeDetector {
    prices: Arc<dyn PriceStore>,
    storage: Arc<dyn NotificationStorage>,
    repository: Arc<NotificationRepository>,
    config: DetectorConfig,
    cycle_guard: tokio::sync::Mutex<()>,
}

impl PriceChangeDetector {
    pub fn new(
        prices: Arc<dyn PriceStore>,
        storage: Arc<dyn NotificationStorage>,
        repository: Arc<NotificationRepository>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            prices,
            storage,
            repository,
            config,
            cycle_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one detection cycle. At most one cycle is ever in flight: an
    /// overlapping trigger gets `Conflict` and the scheduler waits for the
    /// next tick. A store-wide failure aborts the cycle with the error so
    /// the scheduler retries it; a failed cycle is never reported as
    /// successful.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = self.cycle_guard.try_lock().map_err(|_| {
            PipelineError::Conflict("detection cycle already in flight".to_string())
        })?;

        match tokio::time::timeout(self.config.cycle_deadline, self.cycle()).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(format!(
                "detection cycle exceeded {:?}",
                self.config.cycle_deadline
            ))),
        }
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let pairs = self.prices.list_tracked_pairs().await?;

        let mut report = CycleReport {
            pairs_seen: pairs.len(),
            ..CycleReport::default()
        };

        for pair in &pairs {
            match self.check_pair(pair).await {
                Ok(PairOutcome::Alerted) => report.alerts_created += 1,
                Ok(PairOutcome::Deduped) => report.alerts_deduped += 1,
                Ok(PairOutcome::Quiet) => {}
                Err(e) => {
                    warn!("skipping {}: {}", pair, e);
                    report.pairs_skipped += 1;
                }
            }
        }

        info!(
            "detection cycle: pairs={} alerts={} deduped={} skipped={}",
            report.pairs_seen, report.alerts_created, report.alerts_deduped, report.pairs_skipped
        );
        Ok(report)
    }

    async fn check_pair(&self, pair: &PairKey) -> Result<PairOutcome> {
        let latest = self.fetch_latest(pair).await?;

        let Some(baseline) = self.storage.baseline(pair).await? else {
            // First sighting: start tracking, no alert.
            debug!("seeding baseline for {} at {}", pair, latest.price);
            self.repository.commit_detection(pair, &latest, None).await?;
            return Ok(PairOutcome::Quiet);
        };

        // A non-positive baseline cannot produce a meaningful delta; re-seed.
        if baseline.price <= f64::EPSILON {
            self.repository.commit_detection(pair, &latest, None).await?;
            return Ok(PairOutcome::Quiet);
        }

        let change = (latest.price - baseline.price) / baseline.price;
        let alert = if change.abs() >= self.config.threshold {
            Some(PriceAlertPayload {
                crop: pair.crop.clone(),
                location: pair.location.clone(),
                unit: latest.unit.clone(),
                old_price: baseline.price,
                new_price: latest.price,
                percent_change: change * 100.0,
            })
        } else {
            None
        };

        // The baseline advances either way; alerts are gated purely by the
        // threshold and the per-scope cooldown.
        let commit = self.repository.commit_detection(pair, &latest, alert).await?;
        Ok(match commit.alert {
            Some(InsertOutcome::Inserted(_)) => PairOutcome::Alerted,
            Some(InsertOutcome::Deduplicated) => PairOutcome::Deduped,
            None => PairOutcome::Quiet,
        })
    }

    async fn fetch_latest(&self, pair: &PairKey) -> Result<PricePoint> {
        match tokio::time::timeout(self.config.pair_timeout, self.prices.get_latest(pair)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(format!("price fetch for {pair}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubConfig, RealtimeHub};
    use crate::models::Scope;
    use crate::repository::RepositoryConfig;
    use crate::storage::MemoryStorage;
    use chrono::{Duration as ChronoDuration, Utc};
    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;

    #[derive(Default)]
    struct FakePriceStore {
        points: Mutex<FxHashMap<PairKey, PricePoint>>,
        fail_pairs: Mutex<Vec<PairKey>>,
        fail_listing: Mutex<bool>,
        fetch_delay: Mutex<Option<Duration>>,
    }

    impl FakePriceStore {
        fn observe(&self, crop: &str, location: &str, price: f64) {
            let pair = PairKey::new(crop, location);
            self.points.lock().insert(
                pair,
                PricePoint {
                    crop: crop.to_string(),
                    location: location.to_string(),
                    unit: "UGX/kg".to_string(),
                    price,
                    observed_at: Utc::now(),
                },
            );
        }
    }

    #[async_trait::async_trait]
    impl PriceStore for FakePriceStore {
        async fn get_latest(&self, pair: &PairKey) -> Result<PricePoint> {
            let delay = *self.fetch_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_pairs.lock().contains(pair) {
                return Err(PipelineError::TransientIo(format!("fetch failed for {pair}")));
            }
            self.points
                .lock()
                .get(pair)
                .cloned()
                .ok_or_else(|| PipelineError::NotFound(format!("no observations for {pair}")))
        }

        async fn list_tracked_pairs(&self) -> Result<Vec<PairKey>> {
            if *self.fail_listing.lock() {
                return Err(PipelineError::TransientIo("price store unreachable".to_string()));
            }
            Ok(self.points.lock().keys().cloned().collect())
        }
    }

    struct Fixture {
        prices: Arc<FakePriceStore>,
        storage: Arc<MemoryStorage>,
        repository: Arc<NotificationRepository>,
        detector: PriceChangeDetector,
    }

    fn fixture(alert_cooldown: ChronoDuration) -> Fixture {
        let prices = Arc::new(FakePriceStore::default());
        let storage = Arc::new(MemoryStorage::new());
        let hub = Arc::new(RealtimeHub::new(HubConfig::default()));
        let repository = Arc::new(NotificationRepository::new(
            storage.clone(),
            hub,
            RepositoryConfig {
                alert_cooldown,
                ..RepositoryConfig::default()
            },
        ));
        let detector = PriceChangeDetector::new(
            prices.clone(),
            storage.clone(),
            repository.clone(),
            DetectorConfig {
                threshold: 0.05,
                cycle_deadline: Duration::from_secs(5),
                pair_timeout: Duration::from_millis(200),
            },
        );
        Fixture {
            prices,
            storage,
            repository,
            detector,
        }
    }

    #[tokio::test]
    async fn test_first_sighting_seeds_without_alert() {
        let fx = fixture(ChronoDuration::hours(24));
        fx.prices.observe("maize", "kampala", 2500.0);

        let report = fx.detector.run_cycle().await.unwrap();
        assert_eq!(report.pairs_seen, 1);
        assert_eq!(report.alerts_created, 0);

        let baseline = fx
            .storage
            .baseline(&PairKey::new("maize", "kampala"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(baseline.price, 2500.0);
        assert!(fx
            .repository
            .list(&Scope::Marketplace, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sub_threshold_move_advances_without_alert() {
        let fx = fixture(ChronoDuration::hours(24));
        fx.prices.observe("maize", "kampala", 2500.0);
        fx.detector.run_cycle().await.unwrap();

        // 2% move: below the 5% threshold.
        fx.prices.observe("maize", "kampala", 2550.0);
        let report = fx.detector.run_cycle().await.unwrap();
        assert_eq!(report.alerts_created, 0);

        let baseline = fx
            .storage
            .baseline(&PairKey::new("maize", "kampala"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(baseline.price, 2550.0);
        assert!(fx
            .repository
            .list(&Scope::Marketplace, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_maize_kampala_scenario() {
        // Short cooldown so the expiry leg of the scenario is testable.
        let fx = fixture(ChronoDuration::milliseconds(300));
        let pair = PairKey::new("maize", "kampala");

        fx.prices.observe("maize", "kampala", 2500.0);
        fx.detector.run_cycle().await.unwrap();

        // 2500 -> 2800: 12% >= 5% threshold.
        fx.prices.observe("maize", "kampala", 2800.0);
        let report = fx.detector.run_cycle().await.unwrap();
        assert_eq!(report.alerts_created, 1);

        let alerts = fx.repository.list(&Scope::Marketplace, 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].scope, Scope::Marketplace);
        let percent = alerts[0].payload["percentChange"].as_f64().unwrap();
        assert!((percent - 12.0).abs() < 1e-9);
        assert_eq!(alerts[0].payload["oldPrice"].as_f64().unwrap(), 2500.0);
        assert_eq!(alerts[0].payload["newPrice"].as_f64().unwrap(), 2800.0);
        assert_eq!(
            fx.storage.baseline(&pair).await.unwrap().unwrap().price,
            2800.0
        );

        // Another alert-worthy move inside the cooldown: deduped, baseline
        // still advances.
        fx.prices.observe("maize", "kampala", 3100.0);
        let report = fx.detector.run_cycle().await.unwrap();
        assert_eq!(report.alerts_created, 0);
        assert_eq!(report.alerts_deduped, 1);
        assert_eq!(
            fx.storage.baseline(&pair).await.unwrap().unwrap().price,
            3100.0
        );
        assert_eq!(fx.repository.list(&Scope::Marketplace, 10).await.unwrap().len(), 1);

        // Cooldown expires; a 0.7% move stays below threshold, baseline
        // updates regardless.
        tokio::time::sleep(Duration::from_millis(400)).await;
        fx.prices.observe("maize", "kampala", 3122.0);
        let report = fx.detector.run_cycle().await.unwrap();
        assert_eq!(report.alerts_created, 0);
        assert_eq!(report.alerts_deduped, 0);
        assert_eq!(
            fx.storage.baseline(&pair).await.unwrap().unwrap().price,
            3122.0
        );

        // A fresh alert-worthy move after expiry alerts again.
        fx.prices.observe("maize", "kampala", 3500.0);
        let report = fx.detector.run_cycle().await.unwrap();
        assert_eq!(report.alerts_created, 1);
    }

    #[tokio::test]
    async fn test_per_pair_failure_does_not_abort_cycle() {
        let fx = fixture(ChronoDuration::hours(24));
        fx.prices.observe("maize", "kampala", 2500.0);
        fx.prices.observe("beans", "gulu", 4000.0);
        fx.detector.run_cycle().await.unwrap();

        fx.prices.observe("maize", "kampala", 3000.0);
        fx.prices.observe("beans", "gulu", 5000.0);
        fx.fail_pairs_push(PairKey::new("beans", "gulu"));

        let report = fx.detector.run_cycle().await.unwrap();
        assert_eq!(report.pairs_seen, 2);
        assert_eq!(report.pairs_skipped, 1);
        assert_eq!(report.alerts_created, 1);

        // The failed pair kept its old baseline for the next cycle.
        assert_eq!(
            fx.storage
                .baseline(&PairKey::new("beans", "gulu"))
                .await
                .unwrap()
                .unwrap()
                .price,
            4000.0
        );
    }

    impl Fixture {
        fn fail_pairs_push(&self, pair: PairKey) {
            self.prices.fail_pairs.lock().push(pair);
        }
    }

    #[tokio::test]
    async fn test_store_wide_failure_aborts_cycle() {
        let fx = fixture(ChronoDuration::hours(24));
        *fx.prices.fail_listing.lock() = true;

        let result = fx.detector.run_cycle().await;
        assert!(matches!(result, Err(PipelineError::TransientIo(_))));
    }

    #[tokio::test]
    async fn test_slow_pair_fetch_is_skipped() {
        let fx = fixture(ChronoDuration::hours(24));
        fx.prices.observe("maize", "kampala", 2500.0);
        *fx.prices.fetch_delay.lock() = Some(Duration::from_millis(500));

        let report = fx.detector.run_cycle().await.unwrap();
        assert_eq!(report.pairs_skipped, 1);
        // No baseline was seeded for the timed-out pair.
        assert!(fx
            .storage
            .baseline(&PairKey::new("maize", "kampala"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overlapping_cycle_is_rejected() {
        let fx = fixture(ChronoDuration::hours(24));
        fx.prices.observe("maize", "kampala", 2500.0);
        *fx.prices.fetch_delay.lock() = Some(Duration::from_millis(150));

        let detector = Arc::new(fx.detector);
        let first = {
            let detector = detector.clone();
            tokio::spawn(async move { detector.run_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = detector.run_cycle().await;
        assert!(matches!(second, Err(PipelineError::Conflict(_))));
        first.await.unwrap().unwrap();
    }
}
