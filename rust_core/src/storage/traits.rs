//! Storage seam for the notification pipeline.
//!
//! Every backend provides the same atomicity guarantees: the dedup
//! check-and-insert is one unit, and a detection commit (baseline advance
//! plus optional alert insert) either fully applies or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Baseline, NewNotification, Notification, PairKey, Scope};

/// Outcome of a dedup-checked insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Notification),
    /// A live notification with the same dedup key already exists inside
    /// the cooldown window.
    Deduplicated,
}

impl InsertOutcome {
    pub fn created(&self) -> Option<&Notification> {
        match self {
            InsertOutcome::Inserted(n) => Some(n),
            InsertOutcome::Deduplicated => None,
        }
    }
}

/// Result of a detector commit.
#[derive(Debug, Clone)]
pub struct DetectionCommit {
    /// False when the monotonic guard rejected a stale observation.
    pub baseline_advanced: bool,
    pub alert: Option<InsertOutcome>,
}

#[async_trait]
pub trait NotificationStorage: Send + Sync {
    /// Atomic check-and-insert keyed by the dedup key. With a zero
    /// cooldown the window is empty and the insert is unconditional.
    async fn insert_deduped(
        &self,
        new: NewNotification,
        cooldown: Duration,
    ) -> Result<InsertOutcome>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Unexpired notifications visible to `scope` (its own plus global
    /// markers), newest first.
    async fn list(&self, scope: &Scope, limit: i64) -> Result<Vec<Notification>>;

    /// Sets `read_at` if unset. Idempotent; existence and ownership are
    /// checked by the repository.
    async fn set_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Single conditional delete: expired rows, plus read rows created
    /// before `now - retention`. Returns the number removed.
    async fn cleanup(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64>;

    async fn baseline(&self, pair: &PairKey) -> Result<Option<Baseline>>;

    /// Advance the baseline for `pair` to the given observation and, when
    /// `alert` is present, run the dedup-checked insert in the same atomic
    /// unit. The advance is monotonic in observation time; an observation
    /// older than the stored baseline leaves it untouched.
    async fn commit_detection(
        &self,
        pair: &PairKey,
        price: f64,
        observed_at: DateTime<Utc>,
        alert: Option<(NewNotification, Duration)>,
    ) -> Result<DetectionCommit>;
}
