//! Notification persistence plus realtime fan-out.
//!
//! The repository is the single write path for notifications: producers
//! (the detector, registration, listing creation) go through `create` or
//! `commit_detection`, which persist first and then hand the event to the
//! hub. The broadcast is detached and best-effort: a successful return
//! means "stored", never "delivered".

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::hub::RealtimeHub;
use crate::models::{
    NewNotification, Notification, NotificationKind, PairKey, PriceAlertPayload, PricePoint, Scope,
};
use crate::storage::{DetectionCommit, InsertOutcome, NotificationStorage};

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Cooldown window for price-alert dedup keys.
    pub alert_cooldown: Duration,
    /// Dedup window for marketplace event kinds. Zero disables dedup so
    /// distinct listings and registrations are never suppressed.
    pub event_cooldown: Duration,
    /// Lifetime of a freshly created notification.
    pub default_ttl: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            alert_cooldown: Duration::hours(24),
            event_cooldown: Duration::zero(),
            default_ttl: Duration::hours(72),
        }
    }
}

/// Outcome of `create`.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Notification),
    /// Dedup hit inside the cooldown window. Expected, not an error.
    Skipped,
}

impl CreateOutcome {
    pub fn created(&self) -> Option<&Notification> {
        match self {
            CreateOutcome::Created(n) => Some(n),
            CreateOutcome::Skipped => None,
        }
    }
}

pub struct NotificationRepository {
    storage: Arc<dyn NotificationStorage>,
    hub: Arc<RealtimeHub>,
    config: RepositoryConfig,
}

impl NotificationRepository {
    pub fn new(
        storage: Arc<dyn NotificationStorage>,
        hub: Arc<RealtimeHub>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            storage,
            hub,
            config,
        }
    }

    fn cooldown_for(&self, kind: NotificationKind) -> Duration {
        match kind {
            NotificationKind::PriceAlert => self.config.alert_cooldown,
            NotificationKind::NewListing | NotificationKind::UserRegistered => {
                self.config.event_cooldown
            }
        }
    }

    /// Validate and persist a notification, then broadcast it to the
    /// scope's room.
    pub async fn create(
        &self,
        kind: NotificationKind,
        scope: Scope,
        payload: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<CreateOutcome> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let new = NewNotification::new(kind, scope, payload, ttl);

        match self.storage.insert_deduped(new, self.cooldown_for(kind)).await? {
            InsertOutcome::Inserted(notification) => {
                info!(
                    "created {} notification {} for {}",
                    kind.as_str(),
                    notification.id,
                    scope
                );
                self.notify(&notification);
                Ok(CreateOutcome::Created(notification))
            }
            InsertOutcome::Deduplicated => {
                debug!("skipped duplicate {} for {}", kind.as_str(), scope);
                Ok(CreateOutcome::Skipped)
            }
        }
    }

    /// Detector path: advance the pair's baseline and, when `alert` is
    /// given, create the price-alert notification in the same atomic
    /// storage unit, broadcasting on success.
    pub async fn commit_detection(
        &self,
        pair: &PairKey,
        latest: &PricePoint,
        alert: Option<PriceAlertPayload>,
    ) -> Result<DetectionCommit> {
        let alert = match alert {
            Some(payload) => Some((
                NewNotification::price_alert(Scope::Marketplace, &payload, self.config.default_ttl)?,
                self.config.alert_cooldown,
            )),
            None => None,
        };

        let commit = self
            .storage
            .commit_detection(pair, latest.price, latest.observed_at, alert)
            .await?;

        if let Some(InsertOutcome::Inserted(notification)) = &commit.alert {
            info!("created price alert {} for {}", notification.id, pair);
            self.notify(notification);
        }
        Ok(commit)
    }

    /// Unexpired notifications visible to `scope`, newest first.
    pub async fn list(&self, scope: &Scope, limit: i64) -> Result<Vec<Notification>> {
        self.storage.list(scope, limit).await
    }

    /// Mark a notification read on behalf of `requester`. Idempotent;
    /// user-scoped notifications are only touchable by their owner.
    pub async fn mark_read(&self, id: Uuid, requester: Uuid) -> Result<()> {
        let notification = self
            .storage
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("notification {id}")))?;

        if let Scope::User(owner) = notification.scope {
            if owner != requester {
                return Err(PipelineError::Forbidden(format!(
                    "notification {id} belongs to another user"
                )));
            }
        }

        if notification.read_at.is_some() {
            // Already read: success with no state change.
            return Ok(());
        }
        self.storage.set_read(id, Utc::now()).await
    }

    /// Remove expired notifications and read ones older than `retention`.
    pub async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let removed = self.storage.cleanup(Utc::now(), retention).await?;
        if removed > 0 {
            info!("retention cleanup removed {} notifications", removed);
        }
        Ok(removed)
    }

    /// Detached best-effort broadcast. The persisting call has already
    /// returned "stored" by the time delivery is attempted.
    fn notify(&self, notification: &Notification) {
        let hub = self.hub.clone();
        let room = notification.scope.room();
        let event = notification.wire_event();
        tokio::spawn(async move {
            let report = hub.broadcast(&room, &event).await;
            debug!(
                "broadcast to {}: delivered={} skipped={}",
                room, report.delivered, report.skipped
            );
        });
    }
}
