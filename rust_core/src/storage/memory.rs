//! In-memory notification storage.
//!
//! Backs the test suite and embedded callers. A single mutex over the whole
//! state gives the same guarantees the Postgres backend gets from
//! transactions: dedup check-and-insert and detection commits happen in one
//! critical section.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Baseline, NewNotification, Notification, PairKey, Scope};
use crate::storage::traits::{DetectionCommit, InsertOutcome, NotificationStorage};

#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    rows: FxHashMap<Uuid, Row>,
    baselines: FxHashMap<PairKey, Baseline>,
}

struct Row {
    dedup_key: String,
    notification: Notification,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notification_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    fn insert_locked(
        state: &mut State,
        new: NewNotification,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> InsertOutcome {
        if cooldown > Duration::zero() {
            let cutoff = now - cooldown;
            let live = state.rows.values().any(|r| {
                r.dedup_key == new.dedup_key
                    && r.notification.created_at > cutoff
                    && r.notification.expires_at > now
            });
            if live {
                return InsertOutcome::Deduplicated;
            }
        }

        let dedup_key = new.dedup_key.clone();
        let notification = new.into_notification(now);
        state.rows.insert(
            notification.id,
            Row {
                dedup_key,
                notification: notification.clone(),
            },
        );
        InsertOutcome::Inserted(notification)
    }
}

#[async_trait]
impl NotificationStorage for MemoryStorage {
    async fn insert_deduped(
        &self,
        new: NewNotification,
        cooldown: Duration,
    ) -> Result<InsertOutcome> {
        let mut state = self.state.lock();
        Ok(Self::insert_locked(&mut state, new, cooldown, Utc::now()))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self
            .state
            .lock()
            .rows
            .get(&id)
            .map(|r| r.notification.clone()))
    }

    async fn list(&self, scope: &Scope, limit: i64) -> Result<Vec<Notification>> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut visible: Vec<Notification> = state
            .rows
            .values()
            .map(|r| &r.notification)
            .filter(|n| (n.scope == *scope || n.scope.is_global()) && !n.is_expired(now))
            .cloned()
            .collect();
        visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        visible.truncate(limit.max(0) as usize);
        Ok(visible)
    }

    async fn set_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(row) = state.rows.get_mut(&id) {
            if row.notification.read_at.is_none() {
                row.notification.read_at = Some(at);
            }
        }
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64> {
        let cutoff = now - retention;
        let mut state = self.state.lock();
        let before = state.rows.len();
        state.rows.retain(|_, r| {
            let n = &r.notification;
            !(n.expires_at < now || (n.read_at.is_some() && n.created_at < cutoff))
        });
        Ok((before - state.rows.len()) as u64)
    }

    async fn baseline(&self, pair: &PairKey) -> Result<Option<Baseline>> {
        Ok(self.state.lock().baselines.get(pair).cloned())
    }

    async fn commit_detection(
        &self,
        pair: &PairKey,
        price: f64,
        observed_at: DateTime<Utc>,
        alert: Option<(NewNotification, Duration)>,
    ) -> Result<DetectionCommit> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let baseline_advanced = match state.baselines.get(pair) {
            // Monotonic guard: never roll back in observation time.
            Some(current) if current.observed_at > observed_at => false,
            _ => {
                state.baselines.insert(
                    pair.clone(),
                    Baseline {
                        price,
                        observed_at,
                        updated_at: now,
                    },
                );
                true
            }
        };

        let alert =
            alert.map(|(new, cooldown)| Self::insert_locked(&mut state, new, cooldown, now));

        Ok(DetectionCommit {
            baseline_advanced,
            alert,
        })
    }
}
