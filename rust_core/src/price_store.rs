//! Read-only access to the upstream market price history.
//!
//! The price store is an external collaborator: this crate only ever reads
//! the latest observation per pair and the set of tracked pairs.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::{PipelineError, Result};
use crate::models::{PairKey, PricePoint};

#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Latest observation for a pair. `NotFound` when the pair has no
    /// history.
    async fn get_latest(&self, pair: &PairKey) -> Result<PricePoint>;

    /// Every (crop, location) pair with at least one observation.
    async fn list_tracked_pairs(&self) -> Result<Vec<PairKey>>;
}

/// Price store over the platform's `market_prices` table.
pub struct PgPriceStore {
    pool: PgPool,
}

impl PgPriceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceStore for PgPriceStore {
    async fn get_latest(&self, pair: &PairKey) -> Result<PricePoint> {
        let row = sqlx::query(
            r#"
            SELECT crop, location, unit, price, observed_at
            FROM market_prices
            WHERE crop = $1 AND location = $2
            ORDER BY observed_at DESC
            LIMIT 1
            "#,
        )
        .bind(&pair.crop)
        .bind(&pair.location)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| PipelineError::NotFound(format!("no observations for {pair}")))?;
        Ok(PricePoint {
            crop: row.try_get("crop")?,
            location: row.try_get("location")?,
            unit: row.try_get("unit")?,
            price: row.try_get("price")?,
            observed_at: row.try_get("observed_at")?,
        })
    }

    async fn list_tracked_pairs(&self) -> Result<Vec<PairKey>> {
        let rows = sqlx::query("SELECT DISTINCT crop, location FROM market_prices")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(PairKey {
                    crop: row.try_get("crop")?,
                    location: row.try_get("location")?,
                })
            })
            .collect()
    }
}
