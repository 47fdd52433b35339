// Shared models for the AgriLink notification pipeline
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Notification kinds & scopes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    PriceAlert,
    NewListing,
    UserRegistered,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PriceAlert => "PRICE_ALERT",
            NotificationKind::NewListing => "NEW_LISTING",
            NotificationKind::UserRegistered => "USER_REGISTERED",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRICE_ALERT" => Ok(NotificationKind::PriceAlert),
            "NEW_LISTING" => Ok(NotificationKind::NewListing),
            "USER_REGISTERED" => Ok(NotificationKind::UserRegistered),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

/// Delivery target of a notification. The string form doubles as the room
/// name for the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    /// Global marker: visible to every marketplace client.
    Marketplace,
    User(Uuid),
}

impl Scope {
    pub fn room(&self) -> String {
        self.to_string()
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Marketplace)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Marketplace => write!(f, "{}", rooms::MARKETPLACE),
            Scope::User(id) => write!(f, "{}{}", rooms::USER_PREFIX, id),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == rooms::MARKETPLACE {
            return Ok(Scope::Marketplace);
        }
        if let Some(id) = s.strip_prefix(rooms::USER_PREFIX) {
            return id
                .parse::<Uuid>()
                .map(Scope::User)
                .map_err(|_| format!("invalid user scope: {s}"));
        }
        Err(format!("unknown scope: {s}"))
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ============================================================================
// Price observations & baselines
// ============================================================================

/// A tracked (crop, location) combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub crop: String,
    pub location: String,
}

impl PairKey {
    pub fn new(crop: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            crop: crop.into(),
            location: location.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.crop, self.location)
    }
}

/// One observation from the upstream price history. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub crop: String,
    pub location: String,
    pub unit: String,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

impl PricePoint {
    pub fn pair(&self) -> PairKey {
        PairKey::new(self.crop.clone(), self.location.clone())
    }
}

/// Reference price for delta computation. Advances monotonically in
/// observation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub price: f64,
    pub observed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub scope: Scope,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Notification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// The event shape delivered to realtime clients.
    pub fn wire_event(&self) -> WireEvent {
        WireEvent {
            event_type: self.kind,
            data: self.payload.clone(),
            timestamp: self.created_at,
        }
    }
}

/// A notification that has not been persisted yet. The dedup key is the
/// (kind, target) identity under which the storage layer enforces the
/// cooldown window.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub scope: Scope,
    pub payload: serde_json::Value,
    pub ttl: Duration,
    pub dedup_key: String,
}

impl NewNotification {
    pub fn new(
        kind: NotificationKind,
        scope: Scope,
        payload: serde_json::Value,
        ttl: Duration,
    ) -> Self {
        let dedup_key = format!("{}:{}", kind.as_str(), scope);
        Self {
            kind,
            scope,
            payload,
            ttl,
            dedup_key,
        }
    }

    /// Price alerts dedup per (scope, crop, location), not per scope alone.
    pub fn price_alert(
        scope: Scope,
        payload: &PriceAlertPayload,
        ttl: Duration,
    ) -> crate::error::Result<Self> {
        let dedup_key = format!(
            "{}:{}:{}:{}",
            NotificationKind::PriceAlert.as_str(),
            scope,
            payload.crop,
            payload.location
        );
        Ok(Self {
            kind: NotificationKind::PriceAlert,
            scope,
            payload: serde_json::to_value(payload)?,
            ttl,
            dedup_key,
        })
    }

    pub fn into_notification(self, now: DateTime<Utc>) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            kind: self.kind,
            scope: self.scope,
            payload: self.payload,
            created_at: now,
            read_at: None,
            expires_at: now + self.ttl,
        }
    }
}

/// Payload of a `PRICE_ALERT` notification. Field names match the wire
/// contract consumed by the web clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceAlertPayload {
    pub crop: String,
    pub location: String,
    pub unit: String,
    pub old_price: f64,
    pub new_price: f64,
    /// Expressed in percent: a 12% move is 12.0.
    pub percent_change: f64,
}

/// Envelope delivered to realtime clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: NotificationKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Room Names
// ============================================================================

pub mod rooms {
    use uuid::Uuid;

    pub const MARKETPLACE: &str = "marketplace";
    pub const USER_PREFIX: &str = "user:";

    pub fn user(id: Uuid) -> String {
        format!("{USER_PREFIX}{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_roundtrip() {
        let id = Uuid::new_v4();
        let user = Scope::User(id);
        assert_eq!(user.to_string(), format!("user:{id}"));
        assert_eq!(user.to_string().parse::<Scope>().unwrap(), user);

        assert_eq!(Scope::Marketplace.to_string(), "marketplace");
        assert_eq!("marketplace".parse::<Scope>().unwrap(), Scope::Marketplace);
        assert!("user:not-a-uuid".parse::<Scope>().is_err());
        assert!("something-else".parse::<Scope>().is_err());
    }

    #[test]
    fn test_scope_room_matches_room_helpers() {
        let id = Uuid::new_v4();
        assert_eq!(Scope::User(id).room(), rooms::user(id));
        assert_eq!(Scope::Marketplace.room(), rooms::MARKETPLACE);
    }

    #[test]
    fn test_kind_str_roundtrip() {
        for kind in [
            NotificationKind::PriceAlert,
            NotificationKind::NewListing,
            NotificationKind::UserRegistered,
        ] {
            assert_eq!(kind.as_str().parse::<NotificationKind>().unwrap(), kind);
        }
        assert!("PRICE_DROP".parse::<NotificationKind>().is_err());
    }

    #[test]
    fn test_dedup_key_includes_pair_for_alerts() {
        let payload = PriceAlertPayload {
            crop: "maize".to_string(),
            location: "kampala".to_string(),
            unit: "UGX/kg".to_string(),
            old_price: 2500.0,
            new_price: 2800.0,
            percent_change: 12.0,
        };
        let alert =
            NewNotification::price_alert(Scope::Marketplace, &payload, Duration::hours(72))
                .unwrap();
        assert_eq!(alert.dedup_key, "PRICE_ALERT:marketplace:maize:kampala");

        let listing = NewNotification::new(
            NotificationKind::NewListing,
            Scope::Marketplace,
            serde_json::json!({"listingId": "abc"}),
            Duration::hours(72),
        );
        assert_eq!(listing.dedup_key, "NEW_LISTING:marketplace");
    }

    #[test]
    fn test_wire_event_shape() {
        let now = Utc::now();
        let n = Notification {
            id: Uuid::new_v4(),
            kind: NotificationKind::PriceAlert,
            scope: Scope::Marketplace,
            payload: serde_json::json!({"crop": "maize"}),
            created_at: now,
            read_at: None,
            expires_at: now + Duration::hours(72),
        };

        let wire = serde_json::to_value(n.wire_event()).unwrap();
        assert_eq!(wire["type"], "PRICE_ALERT");
        assert_eq!(wire["data"]["crop"], "maize");
        assert!(wire["timestamp"].is_string());
    }

    #[test]
    fn test_price_alert_payload_uses_wire_names() {
        let payload = PriceAlertPayload {
            crop: "maize".to_string(),
            location: "kampala".to_string(),
            unit: "UGX/kg".to_string(),
            old_price: 2500.0,
            new_price: 2800.0,
            percent_change: 12.0,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("oldPrice").is_some());
        assert!(json.get("newPrice").is_some());
        assert!(json.get("percentChange").is_some());
        assert!(json.get("old_price").is_none());
    }

    #[test]
    fn test_notification_expiry() {
        let now = Utc::now();
        let n = NewNotification::new(
            NotificationKind::UserRegistered,
            Scope::Marketplace,
            serde_json::json!({}),
            Duration::hours(1),
        )
        .into_notification(now);

        assert!(!n.is_expired(now));
        assert!(n.is_expired(now + Duration::hours(2)));
    }
}
