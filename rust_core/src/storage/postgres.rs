//! Postgres-backed notification storage.
//!
//! Dedup relies on a transaction-scoped advisory lock over the dedup key
//! followed by a conditional insert, so concurrent producers for the same
//! scope persist exactly one row. Detection commits run the baseline upsert
//! and the alert insert inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::{Baseline, NewNotification, Notification, PairKey, Scope};
use crate::storage::traits::{DetectionCommit, InsertOutcome, NotificationStorage};

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn notification_from_row(row: &PgRow) -> Result<Notification> {
        let kind: String = row.try_get("kind")?;
        let scope: String = row.try_get("scope")?;
        Ok(Notification {
            id: row.try_get("id")?,
            kind: kind.parse().map_err(PipelineError::Internal)?,
            scope: scope.parse().map_err(PipelineError::Internal)?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            read_at: row.try_get("read_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        new: NewNotification,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        // Serialize concurrent writers on the same dedup key for the rest
        // of the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&new.dedup_key)
            .execute(&mut **tx)
            .await?;

        let cutoff = now - cooldown;
        let dedup_key = new.dedup_key.clone();
        let notification = new.into_notification(now);

        let result = sqlx::query(
            r#"
            INSERT INTO notifications (
                id, kind, scope, dedup_key, payload, created_at, read_at, expires_at
            )
            SELECT $1, $2, $3, $4, $5, $6, NULL, $7
            WHERE NOT EXISTS (
                SELECT 1 FROM notifications
                WHERE dedup_key = $4
                  AND created_at > $8
                  AND expires_at > $6
            )
            "#,
        )
        .bind(notification.id)
        .bind(notification.kind.as_str())
        .bind(notification.scope.to_string())
        .bind(&dedup_key)
        .bind(&notification.payload)
        .bind(notification.created_at)
        .bind(notification.expires_at)
        .bind(cutoff)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            debug!("dedup hit for {}", dedup_key);
            Ok(InsertOutcome::Deduplicated)
        } else {
            Ok(InsertOutcome::Inserted(notification))
        }
    }

    async fn advance_baseline_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        pair: &PairKey,
        price: f64,
        observed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // Monotonic guard: a stale observation never rolls the baseline back.
        let result = sqlx::query(
            r#"
            INSERT INTO price_baselines (crop, location, price, observed_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (crop, location) DO UPDATE SET
                price = EXCLUDED.price,
                observed_at = EXCLUDED.observed_at,
                updated_at = EXCLUDED.updated_at
            WHERE price_baselines.observed_at <= EXCLUDED.observed_at
            "#,
        )
        .bind(&pair.crop)
        .bind(&pair.location)
        .bind(price)
        .bind(observed_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl NotificationStorage for PgStorage {
    async fn insert_deduped(
        &self,
        new: NewNotification,
        cooldown: Duration,
    ) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::insert_in_tx(&mut tx, new, cooldown, Utc::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query(
            "SELECT id, kind, scope, payload, created_at, read_at, expires_at \
             FROM notifications WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::notification_from_row).transpose()
    }

    async fn list(&self, scope: &Scope, limit: i64) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, scope, payload, created_at, read_at, expires_at
            FROM notifications
            WHERE (scope = $1 OR scope = $2)
              AND expires_at > $3
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(scope.to_string())
        .bind(Scope::Marketplace.to_string())
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::notification_from_row).collect()
    }

    async fn set_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE notifications SET read_at = $2 WHERE id = $1 AND read_at IS NULL")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64> {
        // Single conditional delete; the predicate is self-contained so a
        // concurrent insert can never satisfy it.
        let result = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE expires_at < $1
               OR (read_at IS NOT NULL AND created_at < $2)
            "#,
        )
        .bind(now)
        .bind(now - retention)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn baseline(&self, pair: &PairKey) -> Result<Option<Baseline>> {
        let row = sqlx::query(
            "SELECT price, observed_at, updated_at FROM price_baselines \
             WHERE crop = $1 AND location = $2",
        )
        .bind(&pair.crop)
        .bind(&pair.location)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(Baseline {
                price: row.try_get("price")?,
                observed_at: row.try_get("observed_at")?,
                updated_at: row.try_get("updated_at")?,
            }),
            None => None,
        })
    }

    async fn commit_detection(
        &self,
        pair: &PairKey,
        price: f64,
        observed_at: DateTime<Utc>,
        alert: Option<(NewNotification, Duration)>,
    ) -> Result<DetectionCommit> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let baseline_advanced =
            Self::advance_baseline_in_tx(&mut tx, pair, price, observed_at, now).await?;

        let alert = match alert {
            Some((new, cooldown)) => Some(Self::insert_in_tx(&mut tx, new, cooldown, now).await?),
            None => None,
        };

        tx.commit().await?;
        Ok(DetectionCommit {
            baseline_advanced,
            alert,
        })
    }
}
